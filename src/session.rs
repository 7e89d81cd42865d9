//! State machine for a single read or write transfer.
//!
//! ```text
//! Queued ─start─▶ RequestSent ─┬─ read:  Data ▶ AckSent(n) ◀─▶ Data ...
//!                              └─ write: Ack  ▶ DataSent(n) ◀─▶ Ack ...
//!                                       ──▶ Completed | Failed
//! ```
//!
//! Transitions are synchronous: each event returns the [`Step`] the queue
//! must carry out. Packets that do not fit the current state are ignored,
//! since they are usually late duplicates of an earlier retransmission.

use std::fmt;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::packet::{encode_ack, encode_data, encode_request, Packet, RequestKind, OCTET};
use crate::timer::{Firing, Retransmit, RetryPolicy};
use crate::BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Queued,
    RequestSent,
    /// Read side: last block acknowledged.
    AckSent(u16),
    /// Write side: last block sent.
    DataSent(u16),
    Completed,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// What the queue has to do after feeding an event to a session.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Ignore,
    /// Send these bytes to the peer. The session has already armed its timer.
    Send(Vec<u8>),
    /// The session reached a terminal state. `last` is a final packet that
    /// expects no response (the closing Ack of a read).
    Done { last: Option<Vec<u8>> },
}

enum Direction {
    Read {
        buffer: Vec<u8>,
        on_done: oneshot::Sender<Result<Vec<u8>>>,
    },
    Write {
        data: Vec<u8>,
        block_count: u16,
        on_done: oneshot::Sender<Result<usize>>,
    },
}

pub struct Session {
    filename: String,
    request: Vec<u8>,
    direction: Direction,
    state: State,
    policy: RetryPolicy,
    retransmit: Option<Retransmit>,
    error: Option<Error>,
}

impl Session {
    pub fn read(
        filename: &str,
        policy: RetryPolicy,
    ) -> Result<(Self, oneshot::Receiver<Result<Vec<u8>>>)> {
        let request = encode_request(RequestKind::Read, filename, OCTET)?;
        let (on_done, rx) = oneshot::channel();
        let direction = Direction::Read {
            buffer: Vec::new(),
            on_done,
        };
        Ok((Self::new(filename, request, direction, policy), rx))
    }

    pub fn write(
        filename: &str,
        data: Vec<u8>,
        policy: RetryPolicy,
    ) -> Result<(Self, oneshot::Receiver<Result<usize>>)> {
        let request = encode_request(RequestKind::Write, filename, OCTET)?;
        // An empty file still needs one empty block to mark its end.
        let blocks = data.len().div_ceil(BLOCK_SIZE).max(1);
        let block_count =
            u16::try_from(blocks).map_err(|_| Error::TooLarge { len: data.len() })?;
        let (on_done, rx) = oneshot::channel();
        let direction = Direction::Write {
            data,
            block_count,
            on_done,
        };
        Ok((Self::new(filename, request, direction, policy), rx))
    }

    fn new(filename: &str, request: Vec<u8>, direction: Direction, policy: RetryPolicy) -> Self {
        Self {
            filename: filename.to_string(),
            request,
            direction,
            state: State::Queued,
            policy,
            retransmit: None,
            error: None,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self.direction {
            Direction::Read { .. } => RequestKind::Read,
            Direction::Write { .. } => RequestKind::Write,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of Data blocks a write sends; `None` for reads.
    pub fn block_count(&self) -> Option<u16> {
        match self.direction {
            Direction::Read { .. } => None,
            Direction::Write { block_count, .. } => Some(block_count),
        }
    }

    /// When the outstanding packet should be resent, if one is in flight.
    pub fn deadline(&self) -> Option<Instant> {
        self.retransmit.as_ref().map(Retransmit::deadline)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Completed | State::Failed)
    }

    /// Moves out of `Queued` and returns the request to send.
    pub fn start(&mut self) -> Vec<u8> {
        self.state = State::RequestSent;
        self.retransmit = Some(Retransmit::arm(self.request.clone(), &self.policy));
        self.request.clone()
    }

    pub fn on_packet(&mut self, packet: Packet) -> Step {
        if matches!(self.state, State::Queued) || self.is_finished() {
            return Step::Ignore;
        }

        match packet {
            Packet::Error { code, message } => {
                self.fail(Error::remote(code, message));
                Step::Done { last: None }
            }
            Packet::Data { block, payload } => self.on_data(block, payload),
            Packet::Ack(block) => self.on_ack(block),
            Packet::Request { .. } => {
                debug!("{}: ignoring request packet", self.filename);
                Step::Ignore
            }
        }
    }

    fn on_data(&mut self, block: u16, payload: Vec<u8>) -> Step {
        let expected = match self.state {
            State::RequestSent => 1,
            State::AckSent(n) => n.wrapping_add(1),
            _ => return Step::Ignore,
        };
        let Direction::Read { buffer, .. } = &mut self.direction else {
            debug!("{}: ignoring data on a write", self.filename);
            return Step::Ignore;
        };
        if block != expected || payload.len() > BLOCK_SIZE {
            debug!(
                "{}: ignoring data #{block} ({} bytes), expected #{expected}",
                self.filename,
                payload.len()
            );
            return Step::Ignore;
        }

        buffer.extend_from_slice(&payload);
        self.retransmit = None;
        let ack = encode_ack(block);

        // A short block is the end of file. A file that is an exact multiple
        // of the block size ends with an empty block; if the server never
        // sends it the timer fails the read.
        if payload.len() < BLOCK_SIZE {
            self.state = State::Completed;
            return Step::Done { last: Some(ack) };
        }

        self.state = State::AckSent(block);
        self.retransmit = Some(Retransmit::arm(ack.clone(), &self.policy));
        Step::Send(ack)
    }

    fn on_ack(&mut self, block: u16) -> Step {
        let expected = match self.state {
            State::RequestSent => 0,
            State::DataSent(n) => n,
            _ => return Step::Ignore,
        };
        let Direction::Write {
            data, block_count, ..
        } = &self.direction
        else {
            debug!("{}: ignoring ack on a read", self.filename);
            return Step::Ignore;
        };
        if block != expected {
            debug!("{}: ignoring ack #{block}, expected #{expected}", self.filename);
            return Step::Ignore;
        }

        self.retransmit = None;
        if block == *block_count {
            self.state = State::Completed;
            return Step::Done { last: None };
        }

        let start = usize::from(block) * BLOCK_SIZE;
        let end = std::cmp::min(start + BLOCK_SIZE, data.len());
        let next = block + 1;
        let pkt = encode_data(next, &data[start..end]);

        self.state = State::DataSent(next);
        self.retransmit = Some(Retransmit::arm(pkt.clone(), &self.policy));
        Step::Send(pkt)
    }

    pub fn on_timeout(&mut self) -> Step {
        let Some(timer) = self.retransmit.as_mut() else {
            return Step::Ignore;
        };
        let resend = match timer.fire(&self.policy) {
            Firing::Resend(bytes) => Ok(bytes.to_vec()),
            Firing::Exhausted(attempts) => Err(attempts),
        };

        match resend {
            Ok(bytes) => Step::Send(bytes),
            Err(attempts) => {
                self.fail(Error::Timeout { attempts });
                Step::Done { last: None }
            }
        }
    }

    /// Marks the session failed. Takes effect on [`Session::finish`].
    pub fn fail(&mut self, error: Error) {
        self.state = State::Failed;
        self.retransmit = None;
        self.error = Some(error);
    }

    /// Delivers the result to whoever is waiting. Consuming the session
    /// guarantees this happens once.
    pub fn finish(self) {
        let result = match (self.error, self.state) {
            (Some(e), _) => Err(e),
            (None, State::Completed) => Ok(()),
            (None, _) => Err(Error::Closed),
        };

        // The receiver may have been dropped; nobody is waiting then.
        match self.direction {
            Direction::Read { buffer, on_done } => {
                let _ = on_done.send(result.map(|_| buffer));
            }
            Direction::Write { data, on_done, .. } => {
                let _ = on_done.send(result.map(|_| data.len()));
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.kind())
            .field("filename", &self.filename)
            .field("state", &self.state)
            .finish()
    }
}
