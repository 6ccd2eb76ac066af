//! Message protocol between the isolation helper and its child process.
//!
//! The child writes packets to its stdout; the parent reads them from the pipe.
//!
//! Packet format:
//! ```text
//! ┌──────────────┐
//! │ magic: u32   │  <- 0x434C5248 "CLRH"
//! │ id: u32      │  <- packet type
//! │ size: u32    │  <- payload size in bytes
//! │ payload...   │  <- variable length, format depends on packet type
//! └──────────────┘
//! ```

use std::io::{self, Read, Write};

use crate::{ErrorKind, MAGIC, RuntimeKind, Stage};

/// Packet header size in bytes
pub const HEADER_SIZE: usize = 12; // magic + id + size

/// Maximum payload size (64KB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Packet types (id field)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketId {
    /// No packet / invalid
    None = 0,
    /// Log message (payload: LogLevel + UTF-8 string)
    Log = 1,
    /// Child is running (payload: pid as u32)
    Ready = 2,
    /// Pipeline stage completed (payload: Stage as u8)
    Stage = 3,
    /// Host constructed (payload: RuntimeKind as u8 + version string)
    RuntimeInfo = 4,
    /// Invocation result (payload: i32)
    Result = 5,
    /// Fatal error (payload: ErrorKind as u8 + Stage as u8 + UTF-8 string)
    Fatal = 6,
}

impl From<u32> for PacketId {
    fn from(v: u32) -> Self {
        match v {
            1 => PacketId::Log,
            2 => PacketId::Ready,
            3 => PacketId::Stage,
            4 => PacketId::RuntimeInfo,
            5 => PacketId::Result,
            6 => PacketId::Fatal,
            _ => PacketId::None,
        }
    }
}

/// Log levels for Log packets
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl From<u8> for LogLevel {
    fn from(v: u8) -> Self {
        match v {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Packet header (12 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub magic: u32,
    pub id: u32,
    pub size: u32,
}

impl PacketHeader {
    pub fn new(id: PacketId, payload_size: usize) -> Self {
        Self {
            magic: MAGIC,
            id: id as u32,
            size: payload_size as u32,
        }
    }

    /// Check if header has valid magic and reasonable size
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC && self.size as usize <= MAX_PAYLOAD_SIZE
    }

    pub fn packet_id(&self) -> PacketId {
        PacketId::from(self.id)
    }

    /// Serialize header to bytes (little-endian)
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.id.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            id: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            size: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

/// A complete packet with header and payload
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    fn with_payload(id: PacketId, payload: Vec<u8>) -> Self {
        Self {
            header: PacketHeader::new(id, payload.len()),
            payload,
        }
    }

    /// Create a log message packet
    pub fn log(level: LogLevel, message: &str) -> Self {
        let message = truncate_utf8(message, MAX_PAYLOAD_SIZE - 1);
        let mut payload = Vec::with_capacity(1 + message.len());
        payload.push(level as u8);
        payload.extend_from_slice(message.as_bytes());
        Self::with_payload(PacketId::Log, payload)
    }

    pub fn ready(pid: u32) -> Self {
        Self::with_payload(PacketId::Ready, pid.to_le_bytes().to_vec())
    }

    pub fn stage(stage: Stage) -> Self {
        Self::with_payload(PacketId::Stage, vec![stage as u8])
    }

    pub fn runtime_info(kind: RuntimeKind, version: Option<&str>) -> Self {
        let version = truncate_utf8(version.unwrap_or(""), MAX_PAYLOAD_SIZE - 1);
        let mut payload = Vec::with_capacity(1 + version.len());
        payload.push(kind as u8);
        payload.extend_from_slice(version.as_bytes());
        Self::with_payload(PacketId::RuntimeInfo, payload)
    }

    pub fn result(value: i32) -> Self {
        Self::with_payload(PacketId::Result, value.to_le_bytes().to_vec())
    }

    /// Create a fatal error packet
    pub fn fatal(kind: ErrorKind, stage: Stage, message: &str) -> Self {
        let message = truncate_utf8(message, MAX_PAYLOAD_SIZE - 2);
        let mut payload = Vec::with_capacity(2 + message.len());
        payload.push(kind as u8);
        payload.push(stage as u8);
        payload.extend_from_slice(message.as_bytes());
        Self::with_payload(PacketId::Fatal, payload)
    }

    pub fn id(&self) -> PacketId {
        self.header.packet_id()
    }

    /// Get log level (for Log packets)
    pub fn log_level(&self) -> Option<LogLevel> {
        if self.id() == PacketId::Log && !self.payload.is_empty() {
            Some(LogLevel::from(self.payload[0]))
        } else {
            None
        }
    }

    /// Get message text (for Log/Fatal packets)
    pub fn message(&self) -> &str {
        match self.id() {
            PacketId::Log if !self.payload.is_empty() => {
                std::str::from_utf8(&self.payload[1..]).unwrap_or("")
            }
            PacketId::Fatal if self.payload.len() >= 2 => {
                std::str::from_utf8(&self.payload[2..]).unwrap_or("")
            }
            _ => "",
        }
    }

    pub fn ready_pid(&self) -> Option<u32> {
        if self.id() == PacketId::Ready && self.payload.len() >= 4 {
            Some(u32::from_le_bytes(self.payload[0..4].try_into().ok()?))
        } else {
            None
        }
    }

    pub fn stage_value(&self) -> Option<Stage> {
        if self.id() == PacketId::Stage && !self.payload.is_empty() {
            Some(Stage::from(self.payload[0]))
        } else {
            None
        }
    }

    /// Parse (kind, version) from a RuntimeInfo packet
    pub fn runtime_info_data(&self) -> Option<(RuntimeKind, Option<String>)> {
        if self.id() != PacketId::RuntimeInfo || self.payload.is_empty() {
            return None;
        }
        let kind = RuntimeKind::from_u8(self.payload[0])?;
        let version = std::str::from_utf8(&self.payload[1..]).ok()?;
        let version = (!version.is_empty()).then(|| version.to_string());
        Some((kind, version))
    }

    pub fn result_value(&self) -> Option<i32> {
        if self.id() == PacketId::Result && self.payload.len() >= 4 {
            Some(i32::from_le_bytes(self.payload[0..4].try_into().ok()?))
        } else {
            None
        }
    }

    /// Parse (kind, stage) from a Fatal packet
    pub fn fatal_data(&self) -> Option<(ErrorKind, Stage)> {
        if self.id() == PacketId::Fatal && self.payload.len() >= 2 {
            Some((ErrorKind::from(self.payload[0]), Stage::from(self.payload[1])))
        } else {
            None
        }
    }

    /// Total size in bytes (header + payload)
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.total_size());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let header = PacketHeader::from_bytes(bytes)?;
        if !header.is_valid() {
            return None;
        }
        let payload_end = HEADER_SIZE + header.size as usize;
        if bytes.len() < payload_end {
            return None;
        }
        Some(Self {
            header,
            payload: bytes[HEADER_SIZE..payload_end].to_vec(),
        })
    }

    /// Write the packet and flush, so the reader sees it immediately.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())?;
        writer.flush()
    }

    /// Read the next packet from a stream.
    ///
    /// Returns `Ok(None)` on a clean end of stream before a header starts.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = reader.read(&mut header_bytes[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated packet header",
                ));
            }
            filled += n;
        }

        let header = PacketHeader::from_bytes(&header_bytes)
            .filter(PacketHeader::is_valid)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid packet header"))?;

        let mut payload = vec![0u8; header.size as usize];
        reader.read_exact(&mut payload)?;
        Ok(Some(Self { header, payload }))
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
