//! FIFO of pending transfers with at most one in flight.
//!
//! The queue owns the sessions, the transport, and the peer address of the
//! active transfer. The transport is opened when the first session needs to
//! send and dropped as soon as nothing is active or pending.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorCode};
use crate::packet::{encode_error, Packet};
use crate::session::{Session, Step};
use crate::transport::Transport;

struct Active {
    session: Session,
    // Source of the first accepted response (the server's transfer id).
    peer: Option<SocketAddr>,
}

type Opener<T> = Box<dyn FnMut() -> io::Result<T> + Send>;

pub struct OperationQueue<T: Transport> {
    server: SocketAddr,
    pending: VecDeque<Session>,
    active: Option<Active>,
    transport: Option<T>,
    open: Opener<T>,
}

impl<T: Transport> OperationQueue<T> {
    pub fn new<F>(server: SocketAddr, open: F) -> Self
    where
        F: FnMut() -> io::Result<T> + Send + 'static,
    {
        Self {
            server,
            pending: VecDeque::new(),
            active: None,
            transport: None,
            open: Box::new(open),
        }
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    pub fn active(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|a| a.session.deadline())
    }

    pub async fn enqueue(&mut self, session: Session) {
        debug!("queued {:?} {}", session.kind(), session.filename());
        self.pending.push_back(session);
        self.activate_next().await;
    }

    /// Starts the next pending session unless one is already active.
    /// Releases the transport when there is nothing left to do.
    pub async fn activate_next(&mut self) {
        while self.active.is_none() {
            let Some(mut session) = self.pending.pop_front() else {
                self.release();
                return;
            };

            let request = session.start();
            match self.send(&request, self.server).await {
                Ok(()) => {
                    info!(
                        "{:?} {} started with {}",
                        session.kind(),
                        session.filename(),
                        self.server
                    );
                    self.active = Some(Active {
                        session,
                        peer: None,
                    });
                }
                Err(e) => {
                    warn!("{}: request not sent: {e}", session.filename());
                    session.fail(Error::Transport(e));
                    session.finish();
                }
            }
        }
    }

    pub async fn on_packet(&mut self, bytes: &[u8], from: SocketAddr) {
        let Some(active) = self.active.as_mut() else {
            debug!("no active transfer, dropping datagram from {from}");
            return;
        };

        if let Some(peer) = active.peer {
            if peer != from {
                warn!("datagram from unknown transfer id {from}, expected {peer}");
                let code = ErrorCode::UnknownTransferId;
                let reply = encode_error(code as u16, &code.to_string());
                if let Err(e) = self.send(&reply, from).await {
                    debug!("error reply to {from} not sent: {e}");
                }
                return;
            }
        }

        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram from {from}: {e}");
                return;
            }
        };

        let step = active.session.on_packet(packet);
        if step != Step::Ignore && active.peer.is_none() {
            active.peer = Some(from);
        }
        self.apply(step).await;
    }

    pub async fn on_timer(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let step = active.session.on_timeout();
        if let Step::Send(_) = step {
            warn!("{}: no response, retransmitting", active.session.filename());
        }
        self.apply(step).await;
    }

    /// The socket itself failed. The active transfer fails and the next one
    /// gets a fresh socket.
    pub async fn on_transport_error(&mut self, error: io::Error) {
        warn!("transport failed: {error}");
        self.transport = None;
        self.fail_active(Error::Transport(error)).await;
    }

    async fn apply(&mut self, step: Step) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let to = active.peer.unwrap_or(self.server);

        match step {
            Step::Ignore => {}
            Step::Send(bytes) => {
                if let Err(e) = self.send(&bytes, to).await {
                    self.fail_active(Error::Transport(e)).await;
                }
            }
            Step::Done { last } => {
                if let Some(bytes) = last {
                    // The transfer is already complete on our side.
                    if let Err(e) = self.send(&bytes, to).await {
                        warn!("final ack to {to} not sent: {e}");
                    }
                }
                self.complete().await;
            }
        }
    }

    async fn fail_active(&mut self, error: Error) {
        if let Some(active) = self.active.as_mut() {
            active.session.fail(error);
        }
        self.complete().await;
    }

    async fn complete(&mut self) {
        if let Some(Active { session, .. }) = self.active.take() {
            info!(
                "{:?} {} finished: {}",
                session.kind(),
                session.filename(),
                session.state()
            );
            session.finish();
        }
        self.activate_next().await;
    }

    async fn send(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => {
                debug!("opening transport");
                (self.open)()?
            }
        };
        let transport = self.transport.insert(transport);
        debug!("sending {} bytes to {to}", bytes.len());
        transport.send_to(bytes, to).await
    }

    fn release(&mut self) {
        if self.transport.take().is_some() {
            debug!("queue drained, transport released");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::time::Duration;

    use super::*;
    use crate::packet::{encode_ack, encode_data, encode_request, RequestKind, OCTET};
    use crate::session::State;
    use crate::timer::RetryPolicy;

    #[derive(Clone, Default)]
    struct Wire {
        sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
        opened: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
        broken: Arc<AtomicBool>,
    }

    impl Wire {
        fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            self.sent.lock().unwrap().clone()
        }

        fn last(&self) -> (Vec<u8>, SocketAddr) {
            self.sent().last().cloned().unwrap()
        }
    }

    struct MockTransport {
        wire: Wire,
    }

    impl Drop for MockTransport {
        fn drop(&mut self) {
            self.wire.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Transport for MockTransport {
        async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
            if self.wire.broken.load(Ordering::SeqCst) {
                return Err(io::Error::other("network unreachable"));
            }
            self.wire.sent.lock().unwrap().push((bytes.to_vec(), to));
            Ok(())
        }
    }

    fn server() -> SocketAddr {
        "127.0.0.1:69".parse().unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(20),
            max_retransmits: 2,
        }
    }

    fn queue() -> (OperationQueue<MockTransport>, Wire) {
        let wire = Wire::default();
        let w = wire.clone();
        let queue = OperationQueue::new(server(), move || {
            w.opened.fetch_add(1, Ordering::SeqCst);
            w.live.fetch_add(1, Ordering::SeqCst);
            Ok(MockTransport { wire: w.clone() })
        });
        (queue, wire)
    }

    fn rrq(name: &str) -> Vec<u8> {
        encode_request(RequestKind::Read, name, OCTET).unwrap()
    }

    #[tokio::test]
    async fn serves_sessions_in_order() {
        let (mut q, wire) = queue();
        let (a, mut a_rx) = Session::read("a", policy()).unwrap();
        let (b, mut b_rx) = Session::read("b", policy()).unwrap();
        let (c, mut c_rx) = Session::write("c", vec![1; 3], policy()).unwrap();
        q.enqueue(a).await;
        q.enqueue(b).await;
        q.enqueue(c).await;

        assert_eq!(wire.sent(), vec![(rrq("a"), server())]);
        assert_eq!(q.pending(), 2);

        q.on_packet(&encode_data(1, b"hello"), peer()).await;
        assert_eq!(a_rx.try_recv().unwrap().unwrap(), b"hello");
        let sent = wire.sent();
        assert_eq!(sent[1], (encode_ack(1), peer()));
        assert_eq!(sent[2], (rrq("b"), server()));
        assert_eq!(q.active().unwrap().filename(), "b");

        let other: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        q.on_packet(&encode_error(1, "File not found."), other).await;
        assert!(matches!(
            b_rx.try_recv().unwrap(),
            Err(Error::Remote { code: 1, .. })
        ));
        assert_eq!(q.active().unwrap().filename(), "c");

        q.on_packet(&encode_ack(0), peer()).await;
        assert_eq!(wire.last(), (encode_data(1, &[1, 1, 1]), peer()));
        q.on_packet(&encode_ack(1), peer()).await;
        assert_eq!(c_rx.try_recv().unwrap().unwrap(), 3);
        assert!(q.is_idle());
    }

    #[tokio::test]
    async fn transport_follows_queue_occupancy() {
        let (mut q, wire) = queue();
        assert!(q.transport().is_none());

        let (a, _a_rx) = Session::read("a", policy()).unwrap();
        q.enqueue(a).await;
        assert!(q.transport().is_some());
        assert_eq!(wire.live.load(Ordering::SeqCst), 1);

        q.on_packet(&encode_data(1, b""), peer()).await;
        assert!(q.transport().is_none());
        assert_eq!(wire.live.load(Ordering::SeqCst), 0);

        let (b, _b_rx) = Session::read("b", policy()).unwrap();
        q.enqueue(b).await;
        assert_eq!(wire.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_sends_do_not_block_the_queue() {
        let (mut q, wire) = queue();
        wire.broken.store(true, Ordering::SeqCst);
        let (a, mut a_rx) = Session::read("a", policy()).unwrap();
        let (b, mut b_rx) = Session::write("b", vec![0; 10], policy()).unwrap();
        q.enqueue(a).await;
        q.enqueue(b).await;

        assert!(matches!(a_rx.try_recv().unwrap(), Err(Error::Transport(_))));
        assert!(matches!(b_rx.try_recv().unwrap(), Err(Error::Transport(_))));
        assert!(q.is_idle());
        assert!(q.transport().is_none());
    }

    #[tokio::test]
    async fn send_failure_mid_transfer_fails_session() {
        let (mut q, wire) = queue();
        let (a, mut a_rx) = Session::write("a", vec![0; 10], policy()).unwrap();
        q.enqueue(a).await;

        wire.broken.store(true, Ordering::SeqCst);
        q.on_packet(&encode_ack(0), peer()).await;
        assert!(matches!(a_rx.try_recv().unwrap(), Err(Error::Transport(_))));
        assert!(q.is_idle());
    }

    #[tokio::test]
    async fn stray_and_malformed_datagrams_are_dropped() {
        let (mut q, wire) = queue();
        q.on_packet(&encode_ack(3), peer()).await;
        assert!(wire.sent().is_empty());

        let (a, mut a_rx) = Session::read("a", policy()).unwrap();
        q.enqueue(a).await;
        q.on_packet(&[0, 9, 0, 0], peer()).await;
        q.on_packet(&[0, 3], peer()).await;
        assert!(a_rx.try_recv().is_err());
        assert_eq!(q.active().unwrap().state(), State::RequestSent);
        assert_eq!(wire.sent().len(), 1);
    }

    #[tokio::test]
    async fn unknown_transfer_id_is_answered_and_ignored() {
        let (mut q, wire) = queue();
        let (a, _a_rx) = Session::read("a", policy()).unwrap();
        q.enqueue(a).await;
        q.on_packet(&encode_data(1, &[0; 512]), peer()).await;

        let intruder: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        q.on_packet(&encode_data(2, b"x"), intruder).await;

        let code = ErrorCode::UnknownTransferId;
        assert_eq!(
            wire.last(),
            (encode_error(code as u16, &code.to_string()), intruder)
        );
        assert_eq!(q.active().unwrap().state(), State::AckSent(1));
    }

    #[tokio::test]
    async fn timer_retransmits_then_fails_and_advances() {
        let (mut q, wire) = queue();
        let (a, mut a_rx) = Session::read("a", policy()).unwrap();
        let (b, _b_rx) = Session::read("b", policy()).unwrap();
        q.enqueue(a).await;
        q.enqueue(b).await;

        q.on_timer().await;
        q.on_timer().await;
        assert!(q.deadline().is_some());
        q.on_timer().await;

        let sent = wire.sent();
        assert_eq!(&sent[..3], &vec![(rrq("a"), server()); 3][..]);
        assert_eq!(sent[3], (rrq("b"), server()));
        assert!(matches!(
            a_rx.try_recv().unwrap(),
            Err(Error::Timeout { attempts: 2 })
        ));
    }

    #[tokio::test]
    async fn ack_retransmits_go_to_the_peer() {
        let (mut q, wire) = queue();
        let (a, _a_rx) = Session::read("a", policy()).unwrap();
        q.enqueue(a).await;
        q.on_packet(&encode_data(1, &[0; 512]), peer()).await;

        q.on_timer().await;
        assert_eq!(wire.last(), (encode_ack(1), peer()));
    }
}
