use std::{
    io,
    os::unix::io::{
        AsRawFd,
        RawFd,
    },
    rc::Rc,
};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio_serial::{
    SerialPortBuilderExt as _,
    SerialStream,
};

use crate::{
    Chunk,
    Error,
    RawSink,
    SinkHandle,
};

const READ_CHUNK: usize = 4096;

/// Serial-port attachment. Reads go through the async stream; writes go
/// through [`SerialSink`], a weak-referenceable handle over the same (already
/// non-blocking) descriptor, so publishers get the same sink surface as TCP.
#[derive(Default)]
pub struct SerialLink {
    path:   Option<String>,
    baud:   u32,
    stream: Option<SerialStream>,
    sink:   Option<Rc<SerialSink>>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("path", &self.path)
            .field("baud", &self.baud)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl SerialLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_path(&mut self, path: &str) {
        let changed = self.path.as_deref() != Some(path);
        self.path = Some(path.to_owned());

        if changed && self.connected() {
            tracing::info!(path, "serial device changed while open, dropping link");
            self.close();
        }
    }

    pub fn set_baud(&mut self, baud: u32) {
        self.baud = baud;
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn configured(&self) -> bool {
        self.path.is_some() && self.baud > 0
    }

    pub fn connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn open(&mut self) -> Result<(), Error> {
        let path = self.path.clone().ok_or(Error::MissingConfig("serial device path"))?;

        if self.baud == 0 {
            return Err(Error::MissingConfig("baud rate"));
        }

        tracing::info!(%path, baud = self.baud, "opening serial port");

        let stream = tokio_serial::new(path.as_str(), self.baud)
            .open_native_async()
            .map_err(|e| Error::Create(io::Error::new(io::ErrorKind::Other, e)))?;

        self.sink = Some(Rc::new(SerialSink {
            fd: stream.as_raw_fd(),
        }));
        self.stream = Some(stream);

        Ok(())
    }

    pub fn close(&mut self) {
        // Sink first: its fd dies with the stream.
        self.sink = None;
        self.stream = None;
    }

    pub async fn read_chunk(&mut self) -> Chunk {
        let Some(stream) = self.stream.as_mut() else {
            return std::future::pending().await;
        };

        let mut buf = [0u8; READ_CHUNK];

        match stream.read(&mut buf).await {
            Ok(0) => {
                self.close();
                Chunk::Closed
            },
            Ok(n) => Chunk::Data(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => {
                tracing::warn!(error = %e, "serial read failed");
                self.close();
                Chunk::Closed
            },
        }
    }

    pub fn try_write(&mut self, mut buf: &[u8]) -> bool {
        let Some(sink) = self.sink.clone() else {
            return false;
        };

        while !buf.is_empty() {
            match sink.try_send(buf) {
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    tracing::warn!(error = %e, "serial write failed");
                    self.close();
                    return false;
                },
            }
        }

        true
    }

    pub fn write_handle(&self) -> Option<SinkHandle> {
        self.sink.as_ref().map(|s| Rc::downgrade(s) as SinkHandle)
    }
}

/// Write-side handle to a serial descriptor. The descriptor is owned by the
/// `SerialStream` inside [`SerialLink`]; this wrapper only exists so the
/// publisher layer can hold a `Weak` to it, exactly like a TCP sink.
#[derive(Debug)]
pub struct SerialSink {
    fd: RawFd,
}

impl RawSink for SerialSink {
    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        // The fd is non-blocking (mio opened it); a full output queue comes
        // back as EAGAIN, which maps to WouldBlock.
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };

        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unconfigured_rejected() {
        let mut link = SerialLink::new();
        assert!(!link.configured());
        assert!(matches!(link.open(), Err(Error::MissingConfig(_))));

        link.set_path("/dev/ttyUSB0");
        assert!(!link.configured());

        link.set_baud(9600);
        assert!(link.configured());
    }

    #[test]
    fn closed_link_refuses_writes() {
        let mut link = SerialLink::new();
        assert!(!link.try_write(b"x"));
        assert!(link.write_handle().is_none());
    }
}
