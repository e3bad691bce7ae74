use std::{
    io,
    rc::Rc,
    time::Duration,
};

use bytes::Bytes;
use tokio::net::{
    TcpListener,
    TcpStream,
};

use crate::{
    Chunk,
    Error,
    RawSink,
    SinkHandle,
};

const READ_CHUNK: usize = 4096;
const BACKLOG: u32 = 5;

/// Outbound TCP connection to an instrument (or a DIGI socket). Configured
/// with host + port, connected on demand; the connected stream sits behind
/// an `Rc` so publishers can hold a weak write handle.
#[derive(Debug, Default)]
pub struct TcpLink {
    host:   Option<String>,
    port:   u16,
    stream: Option<Rc<TcpStream>>,
}

impl TcpLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Changing the host of a live link forces a disconnect; the owner's
    /// reconnect logic picks it up from there. Changes while down are
    /// recorded silently.
    pub fn set_host(&mut self, host: &str) {
        let changed = self.host.as_deref() != Some(host);
        self.host = Some(host.to_owned());

        if changed && self.connected() {
            tracing::info!(host, "instrument host changed while connected, dropping link");
            self.disconnect();
        }
    }

    pub fn set_port(&mut self, port: u16) {
        let changed = self.port != port;
        self.port = port;

        if changed && self.connected() {
            tracing::info!(port, "instrument port changed while connected, dropping link");
            self.disconnect();
        }
    }

    pub fn configured(&self) -> bool {
        self.host.is_some() && self.port > 0
    }

    pub fn connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self, limit: Duration) -> Result<(), Error> {
        let host = self.host.clone().ok_or(Error::MissingConfig("hostname"))?;

        if self.port == 0 {
            return Err(Error::MissingConfig("port"));
        }

        let addr = tokio::net::lookup_host((host.as_str(), self.port))
            .await
            .map_err(|e| Error::HostResolution {
                host: host.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| Error::HostResolution {
                host: host.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            })?;

        tracing::info!(%addr, "connecting to instrument");

        let stream = tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Connect {
                addr: addr.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|e| Error::Connect {
                addr: addr.to_string(),
                source: e,
            })?;

        let _ = stream.set_nodelay(true);
        self.stream = Some(Rc::new(stream));

        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    /// Wait for data and read one chunk. Pends forever while disconnected,
    /// which makes it safe to park in a `select!` arm behind a guard.
    pub async fn read_chunk(&mut self) -> Chunk {
        loop {
            let Some(stream) = self.stream.clone() else {
                return std::future::pending().await;
            };

            if let Err(e) = stream.readable().await {
                tracing::warn!(error = %e, "tcp link readiness failed");
                self.disconnect();
                return Chunk::Closed;
            }

            let mut buf = [0u8; READ_CHUNK];

            match stream.try_read(&mut buf) {
                Ok(0) => {
                    self.disconnect();
                    return Chunk::Closed;
                },
                Ok(n) => return Chunk::Data(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "tcp link read failed");
                    self.disconnect();
                    return Chunk::Closed;
                },
            }
        }
    }

    /// Non-blocking write. `false` means the bytes did not all go out: a
    /// full kernel buffer leaves the link up (caller may retry), anything
    /// fatal drops it.
    pub fn try_write(&mut self, mut buf: &[u8]) -> bool {
        let Some(stream) = self.stream.clone() else {
            return false;
        };

        while !buf.is_empty() {
            match stream.try_write(buf) {
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    tracing::warn!(error = %e, "tcp link write failed");
                    self.disconnect();
                    return false;
                },
            }
        }

        true
    }

    pub fn write_handle(&self) -> Option<SinkHandle> {
        self.stream.as_ref().map(|s| Rc::downgrade(s) as SinkHandle)
    }
}

/// Listening socket that serves at most one peer. Accepting a second peer
/// replaces the first, closing it.
#[derive(Debug)]
pub struct PeerListener {
    port:     u16,
    listener: Option<TcpListener>,
    peer:     Option<Rc<TcpStream>>,
}

impl PeerListener {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            listener: None,
            peer: None,
        }
    }

    pub async fn bind(&mut self) -> Result<(), Error> {
        let socket = tokio::net::TcpSocket::new_v4().map_err(Error::Create)?;
        socket.set_reuseaddr(true).map_err(Error::Create)?;

        socket
            .bind(std::net::SocketAddr::from(([127, 0, 0, 1], self.port)))
            .map_err(Error::Create)?;

        let listener = socket.listen(BACKLOG).map_err(Error::Create)?;

        tracing::info!(port = self.local_port_of(&listener), "listener bound");
        self.listener = Some(listener);

        Ok(())
    }

    fn local_port_of(&self, listener: &TcpListener) -> u16 {
        listener.local_addr().map(|a| a.port()).unwrap_or(self.port)
    }

    /// Close everything and bind again on a new port. Used for runtime
    /// reconfiguration; the accepted peer does not survive.
    pub async fn rebind(&mut self, port: u16) -> Result<(), Error> {
        self.peer = None;
        self.listener = None;
        self.port = port;

        self.bind().await
    }

    /// Stop listening entirely, closing any accepted peer.
    pub fn unbind(&mut self) {
        self.peer = None;
        self.listener = None;
    }

    pub fn is_bound(&self) -> bool {
        self.listener.is_some()
    }

    /// The actual bound port (differs from the configured one when bound
    /// with port 0).
    pub fn local_port(&self) -> Option<u16> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok()).map(|a| a.port())
    }

    pub async fn acceptable(&self) -> io::Result<TcpStream> {
        match &self.listener {
            Some(listener) => listener.accept().await.map(|(stream, _)| stream),
            None => std::future::pending().await,
        }
    }

    /// Install a freshly accepted peer, replacing (and closing) any prior
    /// one.
    pub fn adopt(&mut self, stream: TcpStream) {
        if self.peer.is_some() {
            tracing::info!("replacing existing peer");
        }

        let _ = stream.set_nodelay(true);
        self.peer = Some(Rc::new(stream));
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    pub fn drop_peer(&mut self) {
        self.peer = None;
    }

    pub fn peer_handle(&self) -> Option<SinkHandle> {
        self.peer.as_ref().map(|s| Rc::downgrade(s) as SinkHandle)
    }

    pub async fn peer_readable(&self) -> io::Result<()> {
        match &self.peer {
            Some(peer) => peer.readable().await,
            None => std::future::pending().await,
        }
    }

    /// One non-blocking read from the accepted peer.
    pub fn read_peer_chunk(&mut self) -> Option<Chunk> {
        let peer = self.peer.clone()?;

        let mut buf = [0u8; READ_CHUNK];

        match peer.try_read(&mut buf) {
            Ok(0) => {
                self.peer = None;
                Some(Chunk::Closed)
            },
            Ok(n) => Some(Chunk::Data(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                tracing::warn!(error = %e, "peer read failed");
                self.peer = None;
                Some(Chunk::Closed)
            },
        }
    }

    pub fn write_peer(&mut self, mut buf: &[u8]) -> bool {
        let Some(peer) = self.peer.clone() else {
            return false;
        };

        while !buf.is_empty() {
            match peer.try_send(buf) {
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    tracing::warn!(error = %e, "peer write failed");
                    self.peer = None;
                    return false;
                },
            }
        }

        true
    }
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn link_round_trip() {
        let mut listener = PeerListener::new(0);
        listener.bind().await.unwrap();
        let port = listener.local_port().unwrap();

        let mut link = TcpLink::new();
        link.set_host("127.0.0.1");
        link.set_port(port);
        assert!(link.configured());

        let (connect, accept) =
            tokio::join!(link.connect(Duration::from_secs(1)), listener.acceptable());
        connect.unwrap();
        listener.adopt(accept.unwrap());

        assert!(link.connected());

        assert!(link.try_write(b"ping"));
        listener.peer_readable().await.unwrap();
        assert_eq!(
            listener.read_peer_chunk().unwrap(),
            Chunk::Data(Bytes::from_static(b"ping"))
        );

        assert!(listener.write_peer(b"pong"));
        assert_eq!(link.read_chunk().await, Chunk::Data(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn eof_disconnects_link() {
        let mut listener = PeerListener::new(0);
        listener.bind().await.unwrap();
        let port = listener.local_port().unwrap();

        let mut link = TcpLink::new();
        link.set_host("127.0.0.1");
        link.set_port(port);

        let (connect, accept) =
            tokio::join!(link.connect(Duration::from_secs(1)), listener.acceptable());
        connect.unwrap();
        drop(accept.unwrap());

        assert_eq!(link.read_chunk().await, Chunk::Closed);
        assert!(!link.connected());
    }

    #[tokio::test]
    async fn reconfig_while_connected_drops_link() {
        let mut listener = PeerListener::new(0);
        listener.bind().await.unwrap();
        let port = listener.local_port().unwrap();

        let mut link = TcpLink::new();
        link.set_host("127.0.0.1");
        link.set_port(port);

        let (connect, _accept) =
            tokio::join!(link.connect(Duration::from_secs(1)), listener.acceptable());
        connect.unwrap();
        assert!(link.connected());

        // Same port: recorded silently, link stays up.
        link.set_port(port);
        assert!(link.connected());

        link.set_port(port + 1);
        assert!(!link.connected());
        assert_eq!(link.port(), port + 1);
    }

    #[tokio::test]
    async fn second_peer_replaces_first() {
        let mut listener = PeerListener::new(0);
        listener.bind().await.unwrap();
        let port = listener.local_port().unwrap();

        let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        listener.adopt(listener.acceptable().await.unwrap());
        let first_handle = listener.peer_handle().unwrap();

        let _second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        listener.adopt(listener.acceptable().await.unwrap());

        // Old peer handle is dead and the old client sees EOF.
        assert!(first_handle.upgrade().is_none());

        let mut buf = [0u8; 8];
        use tokio::io::AsyncReadExt;
        assert_eq!(first.read(&mut buf).await.unwrap(), 0);

        let _ = first.shutdown().await;
    }
}
