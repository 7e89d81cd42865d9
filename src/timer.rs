//! Retransmission bookkeeping for the packet a session is waiting on.
//!
//! Only one timer exists per session. Sending a packet that expects a
//! response replaces it; a legitimate response cancels it.

use tokio::time::{Duration, Instant};

use crate::{DEF_TIMEOUT_MS, MAX_RETRANSMITS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait for a response before resending.
    pub timeout: Duration,
    /// Resends allowed before the session fails.
    pub max_retransmits: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEF_TIMEOUT_MS),
            max_retransmits: MAX_RETRANSMITS,
        }
    }
}

/// Outcome of a timer firing.
#[derive(Debug, PartialEq, Eq)]
pub enum Firing<'a> {
    /// Send these exact bytes again.
    Resend(&'a [u8]),
    /// Budget spent; carries the number of resends made.
    Exhausted(u8),
}

#[derive(Debug)]
pub struct Retransmit {
    last_packet: Vec<u8>,
    attempts: u8,
    deadline: Instant,
}

impl Retransmit {
    pub fn arm(last_packet: Vec<u8>, policy: &RetryPolicy) -> Self {
        Self {
            last_packet,
            attempts: 0,
            deadline: Instant::now() + policy.timeout,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn fire(&mut self, policy: &RetryPolicy) -> Firing<'_> {
        if self.attempts >= policy.max_retransmits {
            return Firing::Exhausted(self.attempts);
        }
        self.attempts += 1;
        self.deadline = Instant::now() + policy.timeout;
        Firing::Resend(&self.last_packet)
    }
}
