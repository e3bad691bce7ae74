//! Socket plumbing for the port agent: a non-blocking TCP client link, a
//! single-peer TCP listener, and a serial-port link, all with the same
//! read/write/disconnect surface.
//!
//! Setup problems are the only errors raised here; once a link is up, I/O
//! failure just transitions it to disconnected and the owner decides what to
//! do about it.

use std::{
    io,
    rc::Weak,
};

use bytes::Bytes;

mod serial;
mod tcp;

pub use self::{
    serial::{
        SerialLink,
        SerialSink,
    },
    tcp::{
        PeerListener,
        TcpLink,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing socket configuration: {0}")]
    MissingConfig(&'static str),

    #[error("socket create failure: {0}")]
    Create(io::Error),

    #[error("failed to resolve host {host}: {source}")]
    HostResolution { host: String, source: io::Error },

    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },
}

/// Outcome of one non-blocking read attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Bytes),
    /// EOF or fatal error; the link has marked itself disconnected.
    Closed,
}

/// Non-blocking write endpoint. Publishers hold these weakly; the owning
/// link or listener keeps the strong reference, so a closed sink shows up as
/// a dead `Weak` rather than a dangling descriptor.
pub trait RawSink {
    fn try_send(&self, buf: &[u8]) -> io::Result<usize>;
}

impl RawSink for tokio::net::TcpStream {
    #[inline]
    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}

pub type SinkHandle = Weak<dyn RawSink>;
