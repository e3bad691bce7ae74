//! The agent core: owns the config record, one instrument connection, the
//! publisher list, and the observatory-side listeners, and multiplexes the
//! lot on a single `select!`.
//!
//! Every cycle waits for exactly one wake (socket readiness, an accept, a
//! timer tick, or a signal), handles it with plain non-blocking reads, then
//! drains whatever became ready: instrument data first, then driver
//! commands, then status traffic.

use std::io;
use std::time::Duration;

use backoff::{
    backoff::Backoff,
    ExponentialBackoff,
    ExponentialBackoffBuilder,
};
use bytes::BytesMut;
use tokio::{
    net::TcpStream,
    signal::unix::{
        signal,
        SignalKind,
    },
    time::{
        Instant,
        MissedTickBehavior,
    },
};

use codec::{
    tokio_codec::Decoder as _,
    PacketCodec,
};
use net::{
    Chunk,
    PeerListener,
};
use packet::{
    BufferedPacket,
    Packet,
    PacketType,
    Timestamp,
};

use crate::{
    config::{
        Applied,
        Directive,
        PortAgentConfig,
    },
    connection::{
        ConnEvent,
        Connection,
        State,
    },
    publisher::{
        Publisher,
        PublisherList,
        Role,
    },
};

/// Timer granularity for flush/heartbeat/reconnect deadlines.
const TICK: Duration = Duration::from_millis(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

enum Wake {
    Instrument(ConnEvent),
    DataAccept(io::Result<TcpStream>),
    CommandAccept(io::Result<TcpStream>),
    SnifferAccept(io::Result<TcpStream>),
    ConfigAccept(io::Result<TcpStream>),
    DataPeer,
    CommandPeer,
    ConfigPeer,
    Tick,
    Shutdown,
}

pub struct PortAgent {
    config: PortAgentConfig,

    conn:       Connection,
    publishers: PublisherList,

    data_listener:    PeerListener,
    command_listener: PeerListener,
    sniffer_listener: PeerListener,
    config_listener:  PeerListener,

    instrument_buffer: BufferedPacket,
    command_buffer:    BufferedPacket,

    // RSN data arrives pre-framed by the DIGI; reassembled here instead of
    // going through a buffered packet.
    digi_codec: PacketCodec,
    digi_buf:   BytesMut,

    config_line_buf: Vec<u8>,

    last_heartbeat: Instant,
    last_state:     Option<State>,

    reconnect:      ExponentialBackoff,
    next_reconnect: Option<Instant>,

    shutdown: bool,
}

impl PortAgent {
    /// Bind the observatory-side listeners and assemble the pipeline. Bind
    /// failure here is fatal to startup; nothing is retried.
    pub async fn new(config: PortAgentConfig) -> Result<Self, net::Error> {
        let mut data_listener = PeerListener::new(config.data_port);
        data_listener.bind().await?;

        let mut command_listener = PeerListener::new(config.command_port);
        command_listener.bind().await?;

        let mut config_listener = PeerListener::new(config.config_port);
        config_listener.bind().await?;

        let mut sniffer_listener = PeerListener::new(config.sniffer_port);
        if config.sniffer_port > 0 {
            sniffer_listener.bind().await?;
        }

        let mut publishers = PublisherList::new();
        match Publisher::log_file(&config.log_dir) {
            Ok(publisher) => publishers.upsert(publisher),
            Err(e) => {
                tracing::warn!(error = %e, dir = %config.log_dir.display(), "log file unavailable")
            },
        }

        let conn = Connection::from_config(&config);

        let instrument_buffer = BufferedPacket::new(
            PacketType::DataFromInstrument,
            config.max_packet_size,
            config.flush_interval,
        );
        let command_buffer = BufferedPacket::new(
            PacketType::DataFromDriver,
            config.max_packet_size,
            config.flush_interval,
        );

        let reconnect = ExponentialBackoffBuilder::new()
            .with_max_interval(MAX_RECONNECT_DELAY)
            .with_max_elapsed_time(None)
            .build();

        Ok(Self {
            config,
            conn,
            publishers,
            data_listener,
            command_listener,
            sniffer_listener,
            config_listener,
            instrument_buffer,
            command_buffer,
            digi_codec: PacketCodec::digi(),
            digi_buf: BytesMut::new(),
            config_line_buf: Vec::new(),
            last_heartbeat: Instant::now(),
            last_state: None,
            reconnect,
            next_reconnect: Some(Instant::now()),
            shutdown: false,
        })
    }

    pub fn data_port(&self) -> u16 {
        self.data_listener.local_port().unwrap_or(0)
    }

    pub fn command_port(&self) -> u16 {
        self.command_listener.local_port().unwrap_or(0)
    }

    pub fn config_port(&self) -> u16 {
        self.config_listener.local_port().unwrap_or(0)
    }

    pub fn sniffer_port(&self) -> u16 {
        self.sniffer_listener.local_port().unwrap_or(0)
    }

    pub fn config(&self) -> &PortAgentConfig {
        &self.config
    }

    pub fn connection_state(&self) -> State {
        self.conn.state()
    }

    /// Run until shutdown (signal or `shutdown` command). Completes the
    /// in-flight cycle and drains buffered data before returning.
    pub async fn run(&mut self) -> io::Result<()> {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tracing::info!(
            data_port = self.data_port(),
            command_port = self.command_port(),
            config_port = self.config_port(),
            "port agent running"
        );

        while !self.shutdown {
            let wake = tokio::select! {
                // Pends on its own while there is no live instrument link.
                ev = self.conn.read_event() => Wake::Instrument(ev),

                r = self.data_listener.acceptable() => Wake::DataAccept(r),
                r = self.command_listener.acceptable() => Wake::CommandAccept(r),
                r = self.sniffer_listener.acceptable() => Wake::SnifferAccept(r),
                r = self.config_listener.acceptable() => Wake::ConfigAccept(r),

                _ = self.data_listener.peer_readable() => Wake::DataPeer,
                _ = self.command_listener.peer_readable() => Wake::CommandPeer,
                _ = self.config_listener.peer_readable() => Wake::ConfigPeer,

                _ = tick.tick() => Wake::Tick,

                _ = sigint.recv() => Wake::Shutdown,
                _ = sigterm.recv() => Wake::Shutdown,
            };

            self.handle(wake).await;
        }

        self.finish();
        Ok(())
    }

    async fn handle(&mut self, wake: Wake) {
        match wake {
            Wake::Instrument(ev) => self.on_instrument_event(ev),

            Wake::DataAccept(result) => {
                if let Some(()) = self.adopt(result, Role::DriverData) {
                    if let Some(handle) = self.data_listener.peer_handle() {
                        self.publishers.upsert(Publisher::driver_data(handle));
                    }
                }
            },
            Wake::CommandAccept(result) => {
                if let Some(()) = self.adopt(result, Role::DriverCommand) {
                    if let Some(handle) = self.command_listener.peer_handle() {
                        self.publishers.upsert(Publisher::driver_command(handle));
                    }
                }
            },
            Wake::SnifferAccept(result) => {
                if let Some(()) = self.adopt(result, Role::TcpDataListener) {
                    if let Some(handle) = self.sniffer_listener.peer_handle() {
                        self.publishers.upsert(Publisher::tcp_data_listener(handle));
                    }
                }
            },
            Wake::ConfigAccept(result) => {
                match result {
                    Ok(stream) => {
                        self.config_listener.adopt(stream);
                        self.config_line_buf.clear();
                        tracing::info!("operator session opened");
                    },
                    Err(e) => tracing::warn!(error = %e, "config accept failed"),
                }
            },

            Wake::DataPeer => match self.data_listener.read_peer_chunk() {
                Some(Chunk::Data(bytes)) => {
                    tracing::debug!(len = bytes.len(), "ignoring bytes from data client")
                },
                Some(Chunk::Closed) => {
                    tracing::info!("data client disconnected");
                    self.publishers.remove(Role::DriverData);
                },
                None => {},
            },
            Wake::CommandPeer => match self.command_listener.read_peer_chunk() {
                Some(Chunk::Data(bytes)) => {
                    self.command_buffer.push(&bytes, Timestamp::now());
                    self.drain_ready();
                },
                Some(Chunk::Closed) => {
                    tracing::info!("command client disconnected");
                    self.publishers.remove(Role::DriverCommand);
                },
                None => {},
            },
            Wake::ConfigPeer => self.on_config_readable().await,

            Wake::Tick => self.on_tick(Instant::now(), Timestamp::now()).await,

            Wake::Shutdown => {
                tracing::info!("shutdown requested");
                self.shutdown = true;
            },
        }
    }

    fn adopt(&mut self, result: io::Result<TcpStream>, role: Role) -> Option<()> {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, %role, "accept failed");
                return None;
            },
        };

        tracing::info!(%role, "client connected");

        match role {
            Role::DriverData => self.data_listener.adopt(stream),
            Role::DriverCommand => self.command_listener.adopt(stream),
            Role::TcpDataListener => self.sniffer_listener.adopt(stream),
            _ => return None,
        }

        Some(())
    }

    fn on_instrument_event(&mut self, ev: ConnEvent) {
        match ev {
            ConnEvent::Data(bytes) => {
                if self.conn.kind_tag() == crate::config::InstrumentType::Rsn {
                    self.digi_buf.extend_from_slice(&bytes);

                    loop {
                        match self.digi_codec.decode(&mut self.digi_buf) {
                            Ok(Some(pkt)) => self.publish(&pkt),
                            Ok(None) => break,
                            // The codec has already stepped past the bad
                            // bytes; keep scanning.
                            Err(e) => tracing::warn!(error = %e, "malformed frame from digi"),
                        }
                    }
                } else {
                    self.instrument_buffer.push(&bytes, Timestamp::now());
                    self.drain_ready();
                }
            },

            ConnEvent::Closed => {
                tracing::warn!("instrument disconnected");
                self.conn.disconnect();
                self.emit_status();
                self.emit_fault("instrument disconnected");
                self.schedule_reconnect();
            },

            ConnEvent::HandshakeComplete => {
                tracing::info!("instrument initialization complete");
                self.bind_instrument_publishers();
                self.emit_status();
            },

            ConnEvent::HandshakeFailed(reason) => {
                self.emit_status();
                self.emit_fault(&format!("instrument initialization failed: {reason}"));
                self.schedule_reconnect();
            },

            ConnEvent::Idle => {},
        }
    }

    async fn on_config_readable(&mut self) {
        match self.config_listener.read_peer_chunk() {
            Some(Chunk::Data(bytes)) => {
                self.config_line_buf.extend_from_slice(&bytes);

                while let Some(pos) = self.config_line_buf.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = self.config_line_buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw).trim().to_owned();

                    self.handle_config_line(&line).await;
                }
            },
            Some(Chunk::Closed) => {
                tracing::info!("operator session closed");
                self.config_line_buf.clear();
            },
            None => {},
        }
    }

    async fn handle_config_line(&mut self, line: &str) {
        let directive = match Directive::parse(line) {
            Ok(Some(directive)) => directive,
            Ok(None) => return,
            Err(e) => {
                self.emit_fault(&format!("bad config command: {e}"));
                return;
            },
        };

        tracing::info!(%line, "config command");

        match self.config.apply(&directive) {
            Applied::Quiet => self.config_reply("OK"),
            Applied::Reply(text) => self.config_reply(&text),

            Applied::RebindData(port) => match self.data_listener.rebind(port).await {
                Ok(()) => {
                    self.publishers.remove(Role::DriverData);
                    self.config_reply("OK");
                },
                Err(e) => self.emit_fault(&format!("rebinding data port: {e}")),
            },
            Applied::RebindCommand(port) => match self.command_listener.rebind(port).await {
                Ok(()) => {
                    self.publishers.remove(Role::DriverCommand);
                    self.config_reply("OK");
                },
                Err(e) => self.emit_fault(&format!("rebinding command port: {e}")),
            },
            Applied::RebindSniffer(port) => {
                if port == 0 {
                    self.sniffer_listener.unbind();
                    self.publishers.remove(Role::TcpDataListener);
                    self.config_reply("OK");
                } else {
                    match self.sniffer_listener.rebind(port).await {
                        Ok(()) => {
                            self.publishers.remove(Role::TcpDataListener);
                            self.config_reply("OK");
                        },
                        Err(e) => self.emit_fault(&format!("rebinding sniffer port: {e}")),
                    }
                }
            },

            Applied::InstrumentChanged => {
                if self.conn.kind_tag() != self.config.instrument_type {
                    self.conn = Connection::from_config(&self.config);
                } else {
                    self.conn.sync_config(&self.config);
                }

                self.bind_instrument_publishers();
                self.emit_status();
                self.schedule_reconnect_now();
                self.config_reply("OK");
            },

            Applied::MaxPacketSizeChanged(bytes) => {
                self.instrument_buffer.set_max_payload(bytes);
                self.command_buffer.set_max_payload(bytes);
                self.config_reply("OK");
            },

            Applied::SendBreak(millis) => {
                // On-demand command dialogue; the loop stalls for its
                // bounded window, which is the documented cost of a break.
                if self.conn.send_break(millis).await {
                    self.config_reply("OK");
                } else {
                    self.emit_fault("break command failed");
                }
            },

            Applied::Save => match self.config.save() {
                Ok(()) => self.config_reply("OK"),
                Err(e) => self.emit_fault(&format!("saving config: {e}")),
            },

            Applied::Shutdown => {
                self.shutdown = true;
                self.config_reply("OK");
            },
        }
    }

    fn config_reply(&mut self, text: &str) {
        let line = format!("{text}\r\n");
        self.config_listener.write_peer(line.as_bytes());
    }

    async fn on_tick(&mut self, now: Instant, ts: Timestamp) {
        self.instrument_buffer.tick(ts);
        self.command_buffer.tick(ts);
        self.drain_ready();

        if let Some(ev) = self.conn.poll_deadlines(now) {
            self.on_instrument_event(ev);
        }

        let heartbeat = self.config.heartbeat_interval;
        if !heartbeat.is_zero() {
            while now.duration_since(self.last_heartbeat) >= heartbeat {
                self.last_heartbeat += heartbeat;
                self.emit_heartbeat();
            }
        }

        if self.next_reconnect.is_some_and(|at| now >= at) {
            self.try_initialize().await;
        }
    }

    async fn try_initialize(&mut self) {
        self.next_reconnect = None;

        if !self.conn.configured() {
            // Nothing to do until an operator supplies an endpoint.
            return;
        }

        match self.conn.initialize(CONNECT_TIMEOUT).await {
            Ok(()) => {
                tracing::info!(state = %self.conn.state(), "instrument attached");
                self.reconnect.reset();
                self.bind_instrument_publishers();
                self.emit_status();
            },
            Err(e) => {
                self.emit_fault(&format!("instrument connect failed: {e}"));
                self.emit_status();
                self.schedule_reconnect();
            },
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.reconnect.next_backoff().unwrap_or(MAX_RECONNECT_DELAY);

        tracing::info!(?delay, "scheduling reconnect");
        self.next_reconnect = Some(Instant::now() + delay);
    }

    fn schedule_reconnect_now(&mut self) {
        self.reconnect.reset();
        self.next_reconnect = Some(Instant::now());
    }

    fn bind_instrument_publishers(&mut self) {
        match self.conn.write_handle() {
            Some(handle) => self.publishers.upsert(Publisher::instrument_data(handle)),
            None => self.publishers.remove(Role::InstrumentData),
        }

        match self.conn.command_handle() {
            Some(handle) => self.publishers.upsert(Publisher::instrument_command(handle)),
            None => self.publishers.remove(Role::InstrumentCommand),
        }
    }

    /// Drain order is fixed: inbound data, then driver commands. Status and
    /// fault packets are published at their point of origin.
    fn drain_ready(&mut self) {
        while let Some(pkt) = self.instrument_buffer.drain() {
            self.publish(&pkt);
        }

        while let Some(pkt) = self.command_buffer.drain() {
            self.publish(&pkt);
        }
    }

    /// Fan a packet out; per-sink failures become fault packets, which are
    /// themselves published without further fault recursion.
    fn publish(&mut self, pkt: &Packet) {
        let failures = self.publishers.publish_all(pkt);

        for failure in failures {
            self.emit_fault(&failure.to_string());
        }
    }

    fn emit_fault(&mut self, reason: &str) {
        tracing::error!(reason, "port agent fault");

        match Packet::new(PacketType::PortAgentFault, Timestamp::now(), reason.as_bytes()) {
            Ok(pkt) => {
                // Depth-1 fan-out: failures publishing a fault are only
                // logged by the list.
                let _ = self.publishers.publish_all(&pkt);

                let ascii = pkt.ascii();
                self.config_listener.write_peer(&ascii);
            },
            Err(e) => tracing::error!(error = %e, "building fault packet"),
        }
    }

    fn emit_status(&mut self) {
        let state = self.conn.state();

        if self.last_state == Some(state) {
            return;
        }
        self.last_state = Some(state);

        match Packet::new(PacketType::PortAgentStatus, Timestamp::now(), state.to_string().as_bytes())
        {
            Ok(pkt) => self.publish(&pkt),
            Err(e) => tracing::error!(error = %e, "building status packet"),
        }
    }

    fn emit_heartbeat(&mut self) {
        match Packet::new(PacketType::PortAgentHeartbeat, Timestamp::now(), &[]) {
            Ok(pkt) => self.publish(&pkt),
            Err(e) => tracing::error!(error = %e, "building heartbeat packet"),
        }
    }

    fn finish(&mut self) {
        tracing::info!("port agent shutting down");

        if let Some(pkt) = self.instrument_buffer.flush() {
            self.publish(&pkt);
        }
        if let Some(pkt) = self.command_buffer.flush() {
            self.publish(&pkt);
        }

        self.conn.disconnect();
    }
}
