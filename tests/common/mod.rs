#![allow(dead_code)]

use std::{
    path::PathBuf,
    str::FromStr,
    sync::atomic::{
        AtomicU32,
        Ordering,
    },
    time::Duration,
};

use futures::StreamExt;
use tokio::{
    io::{
        AsyncBufReadExt,
        AsyncWriteExt,
        BufReader,
    },
    net::{
        tcp::OwnedWriteHalf,
        TcpListener,
        TcpStream,
    },
    task::JoinHandle,
};
use tokio_util::codec::FramedRead;
use tracing_subscriber::EnvFilter;

use codec::PacketCodec;
use packet::{
    Packet,
    PacketType,
};
use portagent::{
    config::PortAgentConfig,
    PortAgent,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn trace_init() {
    let level_filter = EnvFilter::from_str("debug").unwrap();

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(level_filter)
        .try_init();
}

static SCRATCH_SEQ: AtomicU32 = AtomicU32::new(0);

/// Per-test scratch directory for log files.
pub fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!(
        "portagent-test-{}-{}",
        std::process::id(),
        SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

/// A config with every listener on an ephemeral loopback port and the
/// heartbeat off; tests switch on exactly what they exercise.
pub fn local_config() -> PortAgentConfig {
    PortAgentConfig {
        heartbeat_interval: Duration::ZERO,
        log_dir: scratch_dir(),
        ..PortAgentConfig::default()
    }
}

pub struct Ports {
    pub data:    u16,
    pub command: u16,
    pub config:  u16,
    pub sniffer: u16,
}

/// Bind an agent and run it as a local task. Call from inside a
/// `LocalSet::run_until`.
pub async fn start_agent(config: PortAgentConfig) -> (JoinHandle<std::io::Result<()>>, Ports) {
    let mut agent = PortAgent::new(config).await.expect("binding agent listeners");

    let ports = Ports {
        data:    agent.data_port(),
        command: agent.command_port(),
        config:  agent.config_port(),
        sniffer: agent.sniffer_port(),
    };

    let handle = tokio::task::spawn_local(async move { agent.run().await });

    (handle, ports)
}

pub type PacketReader = FramedRead<TcpStream, PacketCodec>;

/// Connect a driver-style client that reads framed packets.
pub async fn packet_client(port: u16) -> PacketReader {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connecting client");
    FramedRead::new(stream, PacketCodec::strict())
}

pub async fn recv_packet(reader: &mut PacketReader) -> Packet {
    tokio::time::timeout(WAIT, reader.next())
        .await
        .expect("timed out waiting for a packet")
        .expect("stream closed while waiting for a packet")
        .expect("malformed packet from agent")
}

/// Skip interleaved status/heartbeat traffic until a packet of the wanted
/// type arrives.
pub async fn recv_packet_of(reader: &mut PacketReader, ty: PacketType) -> Packet {
    loop {
        let pkt = recv_packet(reader).await;

        if pkt.packet_type() == ty {
            return pkt;
        }
    }
}

/// An operator session on the config port: writes command lines, reads
/// reply lines.
pub struct OperatorSession {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    tx:    OwnedWriteHalf,
}

impl OperatorSession {
    pub async fn connect(port: u16) -> Self {
        let stream =
            TcpStream::connect(("127.0.0.1", port)).await.expect("connecting operator session");

        let (rx, tx) = stream.into_split();

        Self {
            lines: BufReader::new(rx).lines(),
            tx,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.tx.write_all(format!("{line}\n").as_bytes()).await.expect("sending command");
    }

    pub async fn recv(&mut self) -> String {
        tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a reply")
            .expect("operator session closed")
            .expect("operator session closed")
            .trim_end()
            .to_owned()
    }
}

/// Stand-in instrument: a listener the agent's connection dials into.
pub struct MockInstrument {
    listener: TcpListener,
    pub port: u16,
}

impl MockInstrument {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("binding mock instrument");
        let port = listener.local_addr().unwrap().port();

        Self {
            listener,
            port,
        }
    }

    pub async fn accept(&self) -> TcpStream {
        tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("timed out waiting for the agent to connect")
            .expect("mock instrument accept failed")
            .0
    }
}
