use std::str;

use crate::error::{Error, Result};
use crate::BLOCK_SIZE;

pub const OCTET: &str = "octet";

/// Opcodes from RFC 1350 section 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl TryFrom<u16> for Opcode {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            _ => Err(Error::Protocol(format!("Invalid opcode: {value}"))),
        }
    }
}

/// Which way a transfer goes, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    pub fn opcode(self) -> Opcode {
        match self {
            RequestKind::Read => Opcode::Rrq,
            RequestKind::Write => Opcode::Wrq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request {
        kind: RequestKind,
        filename: String,
        mode: String,
    },
    Data {
        block: u16,
        payload: Vec<u8>,
    },
    Ack(u16),
    Error {
        code: u16,
        message: String,
    },
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Packet::Request {
                kind,
                filename,
                mode,
            } => encode_request(*kind, filename, mode)?,
            Packet::Data { block, payload } => encode_data(*block, payload),
            Packet::Ack(block) => encode_ack(*block),
            Packet::Error { code, message } => encode_error(*code, message),
        };
        Ok(bytes)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Protocol(format!(
                "Packet length too short: {}",
                buf.len()
            )));
        }

        let opcode = Opcode::try_from(u16::from_be_bytes([buf[0], buf[1]]))?;
        let pkt = match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let filename = read_cstr(&buf[2..])?;
                let mode = read_cstr(&buf[2 + filename.len() + 1..])?;
                let kind = if opcode == Opcode::Rrq {
                    RequestKind::Read
                } else {
                    RequestKind::Write
                };
                Packet::Request {
                    kind,
                    filename,
                    mode,
                }
            }
            Opcode::Data => Packet::Data {
                block: u16::from_be_bytes([buf[2], buf[3]]),
                payload: buf[4..].to_vec(),
            },
            Opcode::Ack => Packet::Ack(u16::from_be_bytes([buf[2], buf[3]])),
            Opcode::Error => {
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                // Some servers omit the trailing NUL on error messages.
                let raw = &buf[4..];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                let message = String::from_utf8_lossy(&raw[..end]).into_owned();
                Packet::Error { code, message }
            }
        };

        Ok(pkt)
    }
}

pub fn encode_request(kind: RequestKind, filename: &str, mode: &str) -> Result<Vec<u8>> {
    check_cstr("filename", filename)?;
    check_cstr("mode", mode)?;

    let mut bytes = Vec::with_capacity(4 + filename.len() + mode.len());
    bytes.extend_from_slice(&(kind.opcode() as u16).to_be_bytes());
    bytes.extend_from_slice(filename.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(mode.as_bytes());
    bytes.push(0);
    Ok(bytes)
}

/// The caller slices `payload`; its length decides whether this is the
/// final block.
pub fn encode_data(block: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= BLOCK_SIZE);
    let mut bytes = Vec::with_capacity(4 + payload.len());
    bytes.extend_from_slice(&(Opcode::Data as u16).to_be_bytes());
    bytes.extend_from_slice(&block.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

pub fn encode_ack(block: u16) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4);
    bytes.extend_from_slice(&(Opcode::Ack as u16).to_be_bytes());
    bytes.extend_from_slice(&block.to_be_bytes());
    bytes
}

pub fn encode_error(code: u16, message: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(5 + message.len());
    bytes.extend_from_slice(&(Opcode::Error as u16).to_be_bytes());
    bytes.extend_from_slice(&code.to_be_bytes());
    // An embedded NUL would end the message early on the other side.
    bytes.extend(message.bytes().take_while(|&b| b != 0));
    bytes.push(0);
    bytes
}

fn check_cstr(field: &str, value: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(Error::Encode(format!("{field} contains a NUL byte")));
    }
    Ok(())
}

// Reads a NUL-terminated string
fn read_cstr(buf: &[u8]) -> Result<String> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("Missing cstr terminator".to_string()))?;
    let s = str::from_utf8(&buf[..pos])
        .map_err(|_| Error::Protocol("Invalid cstr encoding".to_string()))?
        .to_string();
    Ok(s)
}
