//! Bounded retry of busy bus transactions
//!
//! A transaction is retried only while the stack reports a busy
//! acknowledgement. Which status words count as busy depends on the stack
//! ABI, so classification is pluggable.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use avbus_core::{AckCode, BusAddress, ExtendedCode, PackedStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::bus::Bus;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Transaction rejected with {0}")]
    Nack(AckCode),
    #[error("Bus still busy after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("Bus I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How often and how fast to retry busy transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    16
}

fn default_delay_ms() -> u64 {
    2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// What to do with the outcome of one attempt
#[derive(Debug)]
pub enum Verdict {
    Accept(u32),
    Retry(AckCode),
    Reject(BusError),
}

/// Maps a primitive's outcome onto a [`Verdict`]
pub trait OutcomeClassifier: Send + Sync + fmt::Debug {
    fn classify(&self, outcome: io::Result<u32>) -> Verdict;
}

/// Older stack ABI: ack code in the upper 16 bits of the status word
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedAckClassifier;

impl OutcomeClassifier for PackedAckClassifier {
    fn classify(&self, outcome: io::Result<u32>) -> Verdict {
        match outcome {
            Ok(status) => {
                let ack = PackedStatus(status).ack();
                if ack.is_busy() {
                    Verdict::Retry(ack)
                } else if ack.is_success() {
                    Verdict::Accept(status)
                } else {
                    Verdict::Reject(BusError::Nack(ack))
                }
            }
            Err(e) => Verdict::Reject(BusError::Io(e)),
        }
    }
}

/// Newer stack ABI: success returns zero, busy surfaces as `EAGAIN`
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrnoClassifier;

impl OutcomeClassifier for ErrnoClassifier {
    fn classify(&self, outcome: io::Result<u32>) -> Verdict {
        match outcome {
            Ok(status) => Verdict::Accept(status),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Verdict::Retry(AckCode::BusyX),
            Err(e) => Verdict::Reject(BusError::Io(e)),
        }
    }
}

/// Runs bus primitives until they stop reporting busy or the policy runs out
#[derive(Debug, Clone)]
pub struct TransactionRetrier {
    classifier: Arc<dyn OutcomeClassifier>,
    policy: RetryPolicy,
}

impl TransactionRetrier {
    pub fn new(classifier: impl OutcomeClassifier + 'static, policy: RetryPolicy) -> Self {
        Self {
            classifier: Arc::new(classifier),
            policy,
        }
    }

    pub fn packed(policy: RetryPolicy) -> Self {
        Self::new(PackedAckClassifier, policy)
    }

    pub fn errno(policy: RetryPolicy) -> Self {
        Self::new(ErrnoClassifier, policy)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `primitive` until it is accepted, rejected, or still busy
    /// after `max_attempts` calls
    pub fn execute<F>(&self, mut primitive: F) -> Result<u32, BusError>
    where
        F: FnMut() -> io::Result<u32>,
    {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.classifier.classify(primitive()) {
                Verdict::Accept(status) => {
                    if attempt > 1 {
                        debug!(attempt, "Transaction accepted after retry");
                    }
                    return Ok(status);
                }
                Verdict::Retry(ack) => {
                    trace!(attempt, ack = %ack, "Bus busy");
                    if attempt < attempts {
                        std::thread::sleep(self.policy.delay());
                    }
                }
                Verdict::Reject(e) => return Err(e),
            }
        }
        warn!(attempts, "Giving up on busy transaction");
        Err(BusError::Exhausted { attempts })
    }

    pub fn read(&self, bus: &dyn Bus, addr: BusAddress, length: usize) -> Result<Vec<u8>, BusError> {
        let mut buf = vec![0u8; length];
        self.execute(|| bus.read(addr, &mut buf))?;
        Ok(buf)
    }

    /// Read one quadlet and convert it from wire order
    pub fn read_quadlet(&self, bus: &dyn Bus, addr: BusAddress) -> Result<u32, BusError> {
        let mut buf = [0u8; 4];
        self.execute(|| bus.read(addr, &mut buf))?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn write(&self, bus: &dyn Bus, addr: BusAddress, data: &[u8]) -> Result<(), BusError> {
        self.execute(|| bus.write(addr, data))?;
        Ok(())
    }

    /// Write quadlets in wire order
    pub fn write_quadlets(&self, bus: &dyn Bus, addr: BusAddress, quadlets: &[u32]) -> Result<(), BusError> {
        let bytes: Vec<u8> = quadlets.iter().flat_map(|q| q.to_be_bytes()).collect();
        self.write(bus, addr, &bytes)
    }

    /// Lock transaction; returns the value held before the operation
    pub fn lock(
        &self,
        bus: &dyn Bus,
        addr: BusAddress,
        code: ExtendedCode,
        data: u32,
        arg: u32,
    ) -> Result<u32, BusError> {
        let mut old = 0;
        self.execute(|| bus.lock(addr, code, data, arg, &mut old))?;
        Ok(old)
    }
}

impl Default for TransactionRetrier {
    fn default() -> Self {
        Self::packed(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avbus_core::ResponseCode;

    fn no_delay(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay_ms: 0,
        }
    }

    fn status(ack: AckCode) -> io::Result<u32> {
        Ok(PackedStatus::new(ack, ResponseCode::Complete).0)
    }

    #[test]
    fn test_always_busy_stops_at_bound() {
        let retrier = TransactionRetrier::packed(no_delay(16));
        let mut calls = 0;
        let result = retrier.execute(|| {
            calls += 1;
            status(AckCode::BusyA)
        });
        assert!(matches!(result, Err(BusError::Exhausted { attempts: 16 })));
        assert_eq!(calls, 16);
    }

    #[test]
    fn test_first_non_busy_attempt_wins() {
        for k in 1..=5 {
            let retrier = TransactionRetrier::packed(no_delay(16));
            let mut calls = 0;
            let result = retrier.execute(|| {
                calls += 1;
                if calls < k {
                    status(AckCode::BusyX)
                } else {
                    status(AckCode::Complete)
                }
            });
            assert!(result.is_ok());
            assert_eq!(calls, k);
        }
    }

    #[test]
    fn test_nack_is_not_retried() {
        let retrier = TransactionRetrier::packed(no_delay(16));
        let mut calls = 0;
        let result = retrier.execute(|| {
            calls += 1;
            status(AckCode::Other(AckCode::TYPE_ERROR))
        });
        assert!(matches!(result, Err(BusError::Nack(AckCode::Other(0xE)))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_errno_classifier_retries_would_block() {
        let retrier = TransactionRetrier::errno(no_delay(4));
        let mut calls = 0;
        let result = retrier.execute(|| {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            } else {
                Ok(0)
            }
        });
        assert_eq!(result.unwrap(), 0);
        assert_eq!(calls, 3);

        let result = retrier.execute(|| Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(matches!(result, Err(BusError::Io(_))));
    }

    #[test]
    fn test_policy_defaults_from_partial_config() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"delay_ms": 5}"#).unwrap();
        assert_eq!(policy.max_attempts, 16);
        assert_eq!(policy.delay(), Duration::from_millis(5));
    }
}
