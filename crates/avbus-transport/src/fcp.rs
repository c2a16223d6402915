//! Function Control Protocol command/response correlation
//!
//! A command frame is written to the target's FCP command register and the
//! answer arrives asynchronously as a write to our FCP response register.
//! The correlator keeps a single capture slot per instance: the listener
//! callback fills it, and the [`ResponseHandle`] returned by
//! [`CommandResponseCorrelator::send_command`] waits on it with a deadline.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use avbus_core::{BusAddress, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::avc::AvcResponse;
use crate::bus::{Bus, FcpHandler};
use crate::retry::{BusError, TransactionRetrier};

/// FCP command register of every AV/C node
pub const FCP_COMMAND_ADDR: u64 = 0xFFFF_F000_0B00;

/// FCP response register of every AV/C node
pub const FCP_RESPONSE_ADDR: u64 = 0xFFFF_F000_0D00;

/// Largest FCP frame accepted, in bytes
pub const MAX_RESPONSE_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum FcpError {
    #[error("A command is already awaiting its response")]
    Busy,
    #[error("No response within the deadline")]
    Timeout,
    #[error("A newer command took over the correlator")]
    Superseded,
    #[error("Could not listen for FCP responses: {0}")]
    Listen(std::io::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcpConfig {
    /// Deadline for a single response
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Extra attempts after a timed out command
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Pause before re-sending a timed out command
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_response_timeout_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    10
}

impl Default for FcpConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl FcpConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// A captured response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCapture {
    /// Length of the stored frame in quadlets; zero means empty
    length: usize,
    data: [u8; MAX_RESPONSE_SIZE],
}

impl ResponseCapture {
    pub fn empty() -> Self {
        Self {
            length: 0,
            data: [0; MAX_RESPONSE_SIZE],
        }
    }

    /// Copy a frame in, truncating to the slot size and to whole quadlets
    pub fn from_frame(frame: &[u8]) -> Self {
        let mut capture = Self::empty();
        let len = frame.len().min(MAX_RESPONSE_SIZE) & !3;
        capture.data[..len].copy_from_slice(&frame[..len]);
        capture.length = len / 4;
        capture
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn len_quadlets(&self) -> usize {
        self.length
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.length * 4]
    }

    /// Frame quadlets converted from wire order
    pub fn quadlets(&self) -> Vec<u32> {
        self.bytes()
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn response(&self) -> Option<AvcResponse> {
        AvcResponse::from_frame(self.bytes())
    }

    fn is_interim(&self) -> bool {
        matches!(self.response(), Some(AvcResponse::Interim))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    Idle,
    Listening,
    Captured,
}

struct Slot {
    state: CorrelatorState,
    /// Bumped for every registered transaction
    generation: u64,
    target: Option<NodeId>,
    capture: ResponseCapture,
    /// Final frame that arrived while an interim frame still held the slot
    deferred: Option<ResponseCapture>,
}

struct Shared {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Listener(Arc<Shared>);

impl FcpHandler for Listener {
    fn on_frame(&self, source: NodeId, response: bool, data: &[u8]) {
        if !response || data.len() < 4 {
            return;
        }
        let mut slot = self.0.slot();
        if slot.state != CorrelatorState::Listening {
            trace!(source = %source, "FCP frame outside a transaction ignored");
            return;
        }
        if slot.target.is_some_and(|target| target != source) {
            debug!(source = %source, "FCP frame from unexpected node ignored");
            return;
        }

        let frame = ResponseCapture::from_frame(data);
        if !frame.is_interim() {
            // Disarm before storing so a late duplicate can never land
            slot.state = CorrelatorState::Captured;
        }
        if slot.capture.is_empty() {
            slot.capture = frame;
        } else if !frame.is_interim() && slot.capture.is_interim() && slot.deferred.is_none() {
            slot.deferred = Some(frame);
        } else {
            debug!(source = %source, "Additional FCP frame dropped");
            return;
        }
        drop(slot);
        self.0.notify.notify_waiters();
    }
}

/// Sends FCP commands and waits for the matching response
pub struct CommandResponseCorrelator {
    bus: Arc<dyn Bus>,
    retrier: TransactionRetrier,
    shared: Arc<Shared>,
}

impl CommandResponseCorrelator {
    pub fn new(bus: Arc<dyn Bus>, retrier: TransactionRetrier) -> Self {
        Self {
            bus,
            retrier,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    state: CorrelatorState::Idle,
                    generation: 0,
                    target: None,
                    capture: ResponseCapture::empty(),
                    deferred: None,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> CorrelatorState {
        self.shared.slot().state
    }

    /// Clear the capture slot and start listening for frames from `target`.
    /// Returns the generation of the new transaction.
    pub fn register(&self, target: Option<NodeId>) -> Result<u64, FcpError> {
        let generation = {
            let mut slot = self.shared.slot();
            if slot.state == CorrelatorState::Listening {
                return Err(FcpError::Busy);
            }
            slot.generation += 1;
            slot.state = CorrelatorState::Listening;
            slot.target = target;
            slot.capture = ResponseCapture::empty();
            slot.deferred = None;
            slot.generation
        };
        // Wake a superseded handle so it stops waiting
        self.shared.notify.notify_waiters();
        let listener = Arc::new(Listener(Arc::clone(&self.shared)));
        if let Err(e) = self.bus.start_fcp_listen(listener) {
            self.shared.slot().state = CorrelatorState::Idle;
            return Err(FcpError::Listen(e));
        }
        Ok(generation)
    }

    /// Stop listening; any frame arriving afterwards is ignored
    pub fn unregister(&self) {
        disarm(self.bus.as_ref(), &self.shared, None);
    }

    /// Write a command frame to `node` and return a handle for its response.
    ///
    /// The write goes through the retrier, which sleeps the calling thread
    /// between busy acknowledgements.
    pub fn send_command(&self, node: NodeId, frame: &[u32]) -> Result<ResponseHandle, FcpError> {
        let generation = self.register(Some(node))?;
        let handle = ResponseHandle {
            bus: Arc::clone(&self.bus),
            shared: Arc::clone(&self.shared),
            generation,
            interims: 0,
        };
        debug!(node = %node, quadlets = frame.len(), "Sending FCP command");
        self.retrier
            .write_quadlets(self.bus.as_ref(), BusAddress::new(node, FCP_COMMAND_ADDR), frame)?;
        Ok(handle)
    }
}

/// Stop the transaction `generation`, or whichever is current when `None`
fn disarm(bus: &dyn Bus, shared: &Shared, generation: Option<u64>) {
    let was_active = {
        let mut slot = shared.slot();
        if generation.is_some_and(|g| g != slot.generation) {
            return;
        }
        let was_active = slot.state != CorrelatorState::Idle;
        slot.state = CorrelatorState::Idle;
        slot.target = None;
        was_active
    };
    if was_active {
        if let Err(e) = bus.stop_fcp_listen() {
            warn!(error = %e, "Failed to stop FCP listener");
        }
    }
}

/// Pending response of one command; dropping it stops listening
pub struct ResponseHandle {
    bus: Arc<dyn Bus>,
    shared: Arc<Shared>,
    generation: u64,
    interims: usize,
}

impl ResponseHandle {
    /// Interim responses skipped so far
    pub fn interims(&self) -> usize {
        self.interims
    }

    /// Wait for the final response. Interim responses are consumed and the
    /// wait continues against the same deadline.
    pub async fn wait(mut self, timeout: Duration) -> Result<ResponseCapture, FcpError> {
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            // Enabled before polling so a frame landing in between still wakes us
            notified.as_mut().enable();
            if let Some(capture) = self.poll()? {
                return Ok(capture);
            }
            if timeout_at(deadline, notified).await.is_err() {
                debug!(interims = self.interims, "FCP response timed out");
                return Err(FcpError::Timeout);
            }
        }
    }

    fn poll(&mut self) -> Result<Option<ResponseCapture>, FcpError> {
        let mut slot = self.shared.slot();
        if slot.generation != self.generation {
            return Err(FcpError::Superseded);
        }
        while !slot.capture.is_empty() {
            if !slot.capture.is_interim() {
                return Ok(Some(slot.capture.clone()));
            }
            self.interims += 1;
            debug!("Interim FCP response, waiting for the final one");
            slot.capture = slot.deferred.take().unwrap_or_else(ResponseCapture::empty);
        }
        Ok(None)
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        disarm(self.bus.as_ref(), &self.shared, Some(self.generation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avc::AvcResponse;
    use crate::retry::RetryPolicy;
    use crate::sim::{SimAvc, SimBus, SimNode};

    fn correlator(bus: &Arc<SimBus>) -> CommandResponseCorrelator {
        let bus: Arc<dyn Bus> = bus.clone();
        CommandResponseCorrelator::new(bus, TransactionRetrier::packed(RetryPolicy::default()))
    }

    fn frame(code: u8) -> Vec<u8> {
        vec![code, 0x20, 0xC3, 0x75]
    }

    #[tokio::test]
    async fn test_single_response_is_captured() {
        let bus = Arc::new(SimBus::new(0).with_node(
            1,
            SimNode::new().with_avc(SimAvc::replying(AvcResponse::Accepted)),
        ));
        let correlator = correlator(&bus);
        let handle = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();
        let capture = handle.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(capture.response(), Some(AvcResponse::Accepted));
        assert_eq!(capture.quadlets(), vec![0x0920_C375]);
        assert_eq!(correlator.state(), CorrelatorState::Idle);
    }

    #[tokio::test]
    async fn test_second_frame_does_not_overwrite() {
        let bus = Arc::new(SimBus::new(0).with_node(1, SimNode::new()));
        let correlator = correlator(&bus);
        let handle = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();

        bus.deliver_fcp(NodeId::local(1), true, &frame(0x09));
        bus.deliver_fcp(NodeId::local(1), true, &frame(0x0A));
        let capture = handle.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(capture.response(), Some(AvcResponse::Accepted));
    }

    #[tokio::test]
    async fn test_frames_from_other_nodes_ignored() {
        let bus = Arc::new(SimBus::new(0).with_node(1, SimNode::new()).with_node(2, SimNode::new()));
        let correlator = correlator(&bus);
        let handle = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();

        bus.deliver_fcp(NodeId::local(2), true, &frame(0x0A));
        bus.deliver_fcp(NodeId::local(1), false, &frame(0x00));
        bus.deliver_fcp(NodeId::local(1), true, &frame(0x0C));
        let capture = handle.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(capture.response(), Some(AvcResponse::Implemented));
    }

    #[tokio::test]
    async fn test_interim_then_final() {
        let bus = Arc::new(SimBus::new(0).with_node(
            1,
            SimNode::new().with_avc(SimAvc::replying(AvcResponse::Accepted).with_interim()),
        ));
        let correlator = correlator(&bus);
        let handle = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();
        let capture = handle.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(capture.response(), Some(AvcResponse::Accepted));
    }

    #[tokio::test]
    async fn test_stale_handle_leaves_newer_command_alone() {
        let bus = Arc::new(SimBus::new(0).with_node(1, SimNode::new()));
        let correlator = correlator(&bus);
        let first = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();
        bus.deliver_fcp(NodeId::local(1), true, &frame(0x09));
        assert_eq!(correlator.state(), CorrelatorState::Captured);

        let second = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();
        assert_eq!(correlator.state(), CorrelatorState::Listening);
        drop(first);
        assert_eq!(correlator.state(), CorrelatorState::Listening);
        assert!(bus.fcp_listening());

        bus.deliver_fcp(NodeId::local(1), true, &frame(0x0C));
        let capture = second.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(capture.response(), Some(AvcResponse::Implemented));
        assert_eq!(correlator.state(), CorrelatorState::Idle);
        assert!(!bus.fcp_listening());
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_take_newer_response() {
        let bus = Arc::new(SimBus::new(0).with_node(1, SimNode::new()));
        let correlator = correlator(&bus);
        let first = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();
        bus.deliver_fcp(NodeId::local(1), true, &frame(0x09));

        let second = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();
        bus.deliver_fcp(NodeId::local(1), true, &frame(0x0C));
        assert!(matches!(
            first.wait(Duration::from_millis(20)).await,
            Err(FcpError::Superseded)
        ));
        let capture = second.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(capture.response(), Some(AvcResponse::Implemented));
    }

    #[tokio::test]
    async fn test_interims_are_counted() {
        let bus = Arc::new(SimBus::new(0).with_node(1, SimNode::new()));
        let correlator = correlator(&bus);
        let mut handle = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();

        bus.deliver_fcp(NodeId::local(1), true, &frame(0x0F));
        assert_eq!(handle.poll().unwrap(), None);
        assert_eq!(handle.interims(), 1);
        assert_eq!(correlator.state(), CorrelatorState::Listening);

        bus.deliver_fcp(NodeId::local(1), true, &frame(0x09));
        let capture = handle.poll().unwrap().unwrap();
        assert_eq!(capture.response(), Some(AvcResponse::Accepted));
        assert_eq!(handle.interims(), 1);
    }

    #[tokio::test]
    async fn test_timeout_disarms() {
        let bus = Arc::new(SimBus::new(0).with_node(1, SimNode::new()));
        let correlator = correlator(&bus);
        let handle = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();
        let result = handle.wait(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(FcpError::Timeout)));
        assert_eq!(correlator.state(), CorrelatorState::Idle);
        assert!(!bus.fcp_listening());

        // A late frame after the handle is gone changes nothing
        bus.deliver_fcp(NodeId::local(1), true, &frame(0x09));
        assert_eq!(correlator.state(), CorrelatorState::Idle);
    }

    #[tokio::test]
    async fn test_only_one_command_in_flight() {
        let bus = Arc::new(SimBus::new(0).with_node(1, SimNode::new()));
        let correlator = correlator(&bus);
        let _handle = correlator.send_command(NodeId::local(1), &[0]).unwrap();
        assert!(matches!(
            correlator.send_command(NodeId::local(1), &[0]),
            Err(FcpError::Busy)
        ));
    }

    #[tokio::test]
    async fn test_short_frames_ignored() {
        let bus = Arc::new(SimBus::new(0).with_node(1, SimNode::new()));
        let correlator = correlator(&bus);
        let handle = correlator.send_command(NodeId::local(1), &[0x0020_C375]).unwrap();

        bus.deliver_fcp(NodeId::local(1), true, &[0x09, 0x20]);
        assert_eq!(correlator.state(), CorrelatorState::Listening);
        bus.deliver_fcp(NodeId::local(1), true, &frame(0x09));
        assert_eq!(correlator.state(), CorrelatorState::Captured);
        assert!(handle.wait(Duration::from_millis(100)).await.is_ok());
    }

    #[test]
    fn test_capture_truncates_oversized_frame() {
        let capture = ResponseCapture::from_frame(&[0x09; MAX_RESPONSE_SIZE + 10]);
        assert_eq!(capture.len_quadlets(), MAX_RESPONSE_SIZE / 4);
        assert!(ResponseCapture::empty().is_empty());
    }
}
