//! Wire packets for the port agent.
//!
//! Everything the agent says to a driver (and everything it relays from an
//! instrument) is one of these: a 16-byte big-endian header followed by an
//! opaque payload. The header layout and checksum are fixed by the driver
//! protocol; see [`Header`].

mod buffered;
mod header;
mod packet;
mod sync_marker;
mod timestamp;

pub use crate::{
    buffered::BufferedPacket,
    header::{
        Header,
        PacketType,
    },
    packet::{
        checksum_of,
        Packet,
        HEADER_SIZE,
        MAX_PACKET_SIZE,
        MAX_PAYLOAD_SIZE,
    },
    sync_marker::{
        SyncMarker,
        SYNC,
    },
    timestamp::{
        Timestamp,
        NTP_UNIX_OFFSET,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("packet parameter out of range: {0}")]
    ParamOutOfRange(&'static str),

    #[error("malformed packet: {0}")]
    Malformed(String),
}
