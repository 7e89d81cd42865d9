mod cli;
mod client;
mod error;
pub mod packet;
pub mod queue;
pub mod session;
pub mod timer;
pub mod transport;

pub use crate::cli::{Cli, Command};
pub use crate::client::{Client, ClientConfig};
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::packet::Packet;
pub use crate::timer::RetryPolicy;

pub const BLOCK_SIZE: usize = 512; // RFC 1350
pub const DEF_PORT: u16 = 69;

pub const DEF_TIMEOUT_MS: u64 = 5000;
pub const MAX_RETRANSMITS: u8 = 3;
