//! Public client handle and the task that drives its queue.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::queue::OperationQueue;
use crate::session::Session;
use crate::timer::RetryPolicy;
use crate::transport::UdpTransport;
use crate::{BLOCK_SIZE, DEF_PORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self {
            server: SocketAddr::new(host, port),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEF_PORT)
    }
}

/// Handle to a TFTP client. Transfers submitted through one client (or its
/// clones) are served one at a time, in call order, over a single socket.
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
    sessions: mpsc::UnboundedSender<Session>,
}

impl Client {
    /// Spawns the driver task, so this must run inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let (sessions, rx) = mpsc::unbounded_channel();
        let server = config.server;
        let queue = OperationQueue::new(server, move || UdpTransport::bind_for(server));
        tokio::spawn(drive(queue, rx));
        Self { config, sessions }
    }

    /// Fetches `filename` from the server into memory.
    pub async fn read(&self, filename: &str) -> Result<Vec<u8>> {
        let (session, done) = Session::read(filename, self.config.retry)?;
        self.submit(session)?;
        done.await.map_err(|_| Error::Closed)?
    }

    /// Sends `data` to the server as `filename`. Returns the number of
    /// bytes sent.
    pub async fn write(&self, filename: &str, data: impl Into<Vec<u8>>) -> Result<usize> {
        let (session, done) = Session::write(filename, data.into(), self.config.retry)?;
        self.submit(session)?;
        done.await.map_err(|_| Error::Closed)?
    }

    fn submit(&self, session: Session) -> Result<()> {
        self.sessions.send(session).map_err(|_| Error::Closed)
    }
}

async fn drive(
    mut queue: OperationQueue<UdpTransport>,
    mut sessions: mpsc::UnboundedReceiver<Session>,
) {
    // Room for one oversized block so it is seen as such and dropped.
    let mut buf = vec![0u8; 4 + BLOCK_SIZE + 1];
    let mut open = true;

    while open || !queue.is_idle() {
        let deadline = queue.deadline();
        tokio::select! {
            session = sessions.recv(), if open => match session {
                Some(session) => queue.enqueue(session).await,
                None => {
                    debug!("all client handles dropped");
                    open = false;
                }
            },
            received = recv(queue.transport(), &mut buf) => match received {
                Ok((n, from)) => queue.on_packet(&buf[..n], from).await,
                Err(e) if is_stray_icmp(&e) => debug!("dropping icmp report: {e}"),
                Err(e) => queue.on_transport_error(e).await,
            },
            _ = expire(deadline) => queue.on_timer().await,
        }
    }
    debug!("client driver stopped");
}

// Some platforms surface an ICMP port-unreachable for an earlier datagram
// (for example an error reply to a stray port) on the next receive. The
// socket itself is still fine.
fn is_stray_icmp(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

async fn recv(
    transport: Option<&UdpTransport>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match transport {
        Some(transport) => transport.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
