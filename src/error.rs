use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A request could not be put on the wire.
    #[error("cannot encode packet: {0}")]
    Encode(String),

    /// An inbound datagram was malformed.
    #[error("malformed packet: {0}")]
    Protocol(String),

    /// The peer answered with an Error packet.
    #[error("server error {code}: {message}")]
    Remote { code: u16, message: String },

    /// No response arrived after the whole retransmission budget.
    #[error("no response after {attempts} retransmissions")]
    Timeout { attempts: u8 },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Block numbers are 16 bit, so a write is capped at 65535 blocks.
    #[error("{len} bytes do not fit in 65535 blocks")]
    TooLarge { len: usize },

    #[error("client has shut down")]
    Closed,
}

impl Error {
    /// Builds a remote error, falling back to the standard description
    /// when the peer sent no message.
    pub fn remote(code: u16, message: String) -> Self {
        let message = if message.is_empty() {
            ErrorCode::from(code).to_string()
        } else {
            message
        };
        Error::Remote { code, message }
    }
}

/// Error codes defined by RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl From<u16> for ErrorCode {
    // Unknown codes are reported as "not defined".
    fn from(code: u16) -> Self {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::NotDefined => "Not defined, see error message (if any).",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalOperation => "Illegal TFTP operation.",
            ErrorCode::UnknownTransferId => "Unknown transfer ID.",
            ErrorCode::FileAlreadyExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_are_not_defined() {
        assert_eq!(ErrorCode::from(42), ErrorCode::NotDefined);
        assert_eq!(ErrorCode::from(6), ErrorCode::FileAlreadyExists);
    }

    #[test]
    fn empty_remote_message_uses_standard_text() {
        match Error::remote(1, String::new()) {
            Error::Remote { code, message } => {
                assert_eq!(code, 1);
                assert_eq!(message, "File not found.");
            }
            e => panic!("unexpected {e:?}"),
        }
    }

    #[test]
    fn remote_display() {
        let e = Error::remote(2, "nope".to_string());
        assert_eq!(e.to_string(), "server error 2: nope");
        let e = Error::remote(2, String::new());
        assert_eq!(e.to_string(), "server error 2: Access violation.");
    }
}
