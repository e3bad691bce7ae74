use std::fmt::Write as _;

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use packed_struct::prelude::*;

use crate::{
    Error,
    Header,
    PacketType,
    SyncMarker,
    Timestamp,
};

pub const HEADER_SIZE: usize = 16;
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// One framed packet: a 16-byte header plus payload in a single contiguous
/// buffer. Immutable once built; moves through the pipeline, publishers
/// borrow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    timestamp:   Timestamp,
    checksum:    u16,
    bytes:       Bytes,
}

/// 16-bit XOR over the whole frame with the checksum field treated as zero.
/// Folding bytes into a u16 keeps the stored value's high byte zero, so a
/// verifier that XORs *every* byte (stored checksum included) lands on zero.
pub fn checksum_of(frame: &[u8]) -> u16 {
    frame
        .iter()
        .enumerate()
        .filter(|(i, _)| !(6..8).contains(i))
        .fold(0u16, |c, (_, b)| c ^ u16::from(*b))
}

impl Packet {
    /// Build a packet from a fully-known payload.
    pub fn new(
        packet_type: PacketType,
        timestamp: Timestamp,
        payload: &[u8],
    ) -> Result<Self, Error> {
        if packet_type == PacketType::Unknown {
            return Err(Error::ParamOutOfRange("packet type UNKNOWN"));
        }

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::ParamOutOfRange("payload exceeds 65519 bytes"));
        }

        let header = Header {
            sync: SyncMarker,
            packet_type,
            packet_size: (HEADER_SIZE + payload.len()) as u16,
            checksum: 0,
            timestamp,
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_slice(&header.pack().map_err(|e| Error::Malformed(e.to_string()))?);
        buf.put_slice(payload);

        let checksum = checksum_of(&buf);
        buf[6..8].copy_from_slice(&checksum.to_be_bytes());

        Ok(Self {
            packet_type,
            timestamp,
            checksum,
            bytes: buf.freeze(),
        })
    }

    /// Parse and validate a complete frame as received from the wire.
    pub fn from_wire(bytes: Bytes) -> Result<Self, Error> {
        let header = Self::unpack_header(&bytes)?;

        if header.packet_type == PacketType::Unknown {
            return Err(Error::Malformed("packet type UNKNOWN".into()));
        }

        if header.packet_size as usize != bytes.len() {
            return Err(Error::Malformed(format!(
                "size field {} != frame length {}",
                header.packet_size,
                bytes.len()
            )));
        }

        let expected = checksum_of(&bytes);
        if expected != header.checksum {
            return Err(Error::Malformed(format!(
                "checksum {:#06x} != computed {:#06x}",
                header.checksum, expected
            )));
        }

        Ok(Self {
            packet_type: header.packet_type,
            timestamp: header.timestamp,
            checksum: header.checksum,
            bytes,
        })
    }

    /// Adopt a frame the DIGI already framed on the instrument side. The blob
    /// is classified DATA_FROM_RSN and forwarded as-is; the embedded checksum
    /// is checked but a mismatch only logs, since the DIGI's coverage of the
    /// header is not documented.
    pub fn from_digi(bytes: Bytes) -> Result<Self, Error> {
        let header = Self::unpack_header(&bytes)?;

        let expected = checksum_of(&bytes);
        if expected != header.checksum {
            tracing::warn!(
                stored = header.checksum,
                computed = expected,
                "digi frame checksum mismatch, forwarding anyway"
            );
        }

        Ok(Self {
            packet_type: PacketType::DataFromRsn,
            timestamp: header.timestamp,
            checksum: header.checksum,
            bytes,
        })
    }

    fn unpack_header(bytes: &Bytes) -> Result<Header, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Malformed(format!("{} bytes is shorter than a header", bytes.len())));
        }

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&bytes[..HEADER_SIZE]);

        Header::unpack(&raw).map_err(|e| Error::Malformed(e.to_string()))
    }

    #[inline]
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    #[inline]
    pub fn packet_size(&self) -> u16 {
        self.bytes.len() as u16
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// The log-file projection. Payload bytes pass through untouched, so the
    /// result is byte-exact rather than lossy utf-8.
    pub fn ascii(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.bytes.len() + 64);

        out.put_slice(
            format!(
                "<port_agent_packet type=\"{}\" time=\"{}\">",
                self.packet_type.as_str(),
                self.timestamp
            )
            .as_bytes(),
        );
        out.put_slice(self.payload());
        out.put_slice(b"</port_agent_packet>\r\n");

        out.freeze()
    }

    /// Multi-line human-readable dump for logging.
    pub fn pretty(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "Type: {} ({})", self.packet_type as u8, self.packet_type);
        let _ = writeln!(out, "Size: {}", self.packet_size());
        let _ = writeln!(out, "Checksum: {:#06x}", self.checksum);
        let _ = writeln!(out, "Timestamp: {}", self.timestamp);

        let _ = write!(out, "Payload (ascii): ");
        for b in self.payload() {
            if b.is_ascii_graphic() || *b == b' ' {
                out.push(*b as char);
            } else {
                let _ = write!(out, "\\x{:02x}", b);
            }
        }
        out.push('\n');

        let _ = writeln!(out, "Full packet (hex): {}", hex::encode(&self.bytes));

        out
    }
}

impl AsRef<[u8]> for Packet {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}
