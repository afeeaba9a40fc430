//! ouroboros KV server wire protocol
//!
//! Request: `[command: u8][len: u32 BE][payload]`
//! Response: `[status: u8][len: u32 BE][payload]`
//!
//! Only the commands and value types this backend needs are covered.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in either direction
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid command: {0}")]
    InvalidCommand(u8),

    #[error("Invalid status: {0}")]
    InvalidStatus(u8),

    #[error("Invalid value type: {0}")]
    InvalidValueType(u8),

    #[error("Payload too large: {0} bytes (max 64MB)")]
    PayloadTooLarge(u32),

    #[error("Key too long: {0} bytes")]
    KeyTooLong(usize),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Unexpected end of data")]
    UnexpectedEof,
}

/// Command codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Get = 0x01,
    Set = 0x02,
    Del = 0x03,
    Ping = 0x08,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Command::Get),
            0x02 => Ok(Command::Set),
            0x03 => Ok(Command::Del),
            0x08 => Ok(Command::Ping),
            _ => Err(ProtocolError::InvalidCommand(byte)),
        }
    }
}

/// Response status codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0x00,
    Null = 0x01,
    Error = 0x02,
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(Status::Ok),
            0x01 => Ok(Status::Null),
            0x02 => Ok(Status::Error),
            _ => Err(ProtocolError::InvalidStatus(byte)),
        }
    }
}

const VALUE_STRING: u8 = 0x04;
const VALUE_BYTES: u8 = 0x05;

/// Write one frame (`tag`, length, payload)
pub async fn write_frame<W>(writer: &mut W, tag: u8, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(ProtocolError::PayloadTooLarge(payload.len() as u32));
    }
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(tag);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read one frame, returning its tag byte and payload
pub async fn read_frame<R>(reader: &mut R) -> Result<(u8, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok((header[0], payload))
}

/// Encode raw bytes as a `Bytes` value
pub fn encode_bytes(value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + value.len());
    buf.push(VALUE_BYTES);
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Decode a `Bytes` or `String` value into raw bytes
pub fn decode_bytes(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let (&type_byte, rest) = data.split_first().ok_or(ProtocolError::UnexpectedEof)?;
    if type_byte != VALUE_BYTES && type_byte != VALUE_STRING {
        return Err(ProtocolError::InvalidValueType(type_byte));
    }
    if rest.len() < 4 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let body = rest.get(4..4 + len).ok_or(ProtocolError::UnexpectedEof)?;
    Ok(body.to_vec())
}

/// Build a SET payload: `key_len(2) + key + ttl_ms(8) + value`
pub fn set_payload(key: &str, value: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let key_len = u16::try_from(key.len()).map_err(|_| ProtocolError::KeyTooLong(key.len()))?;
    let mut payload = Vec::with_capacity(2 + key.len() + 8 + 5 + value.len());
    payload.extend_from_slice(&key_len.to_be_bytes());
    payload.extend_from_slice(key.as_bytes());
    // No expiry
    payload.extend_from_slice(&0u64.to_be_bytes());
    payload.extend_from_slice(&encode_bytes(value));
    Ok(payload)
}

/// Parse a SET payload back into `(key, value)`
pub fn parse_set_payload(payload: &[u8]) -> Result<(String, Vec<u8>), ProtocolError> {
    if payload.len() < 2 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let key_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let pos = 2;
    if payload.len() < pos + key_len + 8 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let key = std::str::from_utf8(&payload[pos..pos + key_len])
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_string();
    let value = decode_bytes(&payload[pos + key_len + 8..])?;
    Ok((key, value))
}

/// Parse a bare key payload (GET, DEL)
pub fn parse_key(payload: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(payload)
        .map(|s| s.to_string())
        .map_err(|_| ProtocolError::InvalidUtf8)
}
