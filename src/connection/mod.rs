//! Instrument attachments. One [`Connection`] per agent, dispatched by kind:
//! plain TCP, serial, RSN (DIGI-fronted), or BOTPT. Each drives the shared
//! state machine
//! `Unconfigured -> Configured -> Initializing -> Ready -> Disconnected`,
//! with `Disconnected` retried by the agent's backoff timer.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use net::{
    Chunk,
    SerialLink,
    SinkHandle,
    TcpLink,
};

use crate::config::{
    InstrumentType,
    PortAgentConfig,
};

pub mod rsn;

pub use rsn::RsnInstrument;

#[derive(Copy, Clone, Debug, PartialEq, Eq, derive_more::Display)]
pub enum State {
    #[display(fmt = "UNCONFIGURED")]
    Unconfigured,
    #[display(fmt = "CONFIGURED")]
    Configured,
    #[display(fmt = "INITIALIZING")]
    Initializing,
    #[display(fmt = "READY")]
    Ready,
    #[display(fmt = "DISCONNECTED")]
    Disconnected,
}

/// What the instrument side produced on one event-loop wake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    Data(Bytes),
    Closed,
    HandshakeComplete,
    HandshakeFailed(String),
    Idle,
}

#[derive(Debug, Default)]
pub struct TcpInstrument {
    pub data: TcpLink,
}

#[derive(Debug, Default)]
pub struct SerialInstrument {
    pub port: SerialLink,
}

/// BOTPT instruments expose separate sockets for the two directions: the
/// agent reads from the data port and writes through the command-side
/// socket.
#[derive(Debug, Default)]
pub struct BotptInstrument {
    pub data:    TcpLink,
    pub command: TcpLink,
}

#[derive(Debug)]
pub enum Kind {
    Tcp(TcpInstrument),
    Serial(SerialInstrument),
    Rsn(RsnInstrument),
    Botpt(BotptInstrument),
}

#[derive(Debug)]
pub struct Connection {
    kind:  Kind,
    state: State,
}

impl Connection {
    pub fn from_config(config: &PortAgentConfig) -> Self {
        let kind = match config.instrument_type {
            InstrumentType::Tcp => Kind::Tcp(TcpInstrument::default()),
            InstrumentType::Serial => Kind::Serial(SerialInstrument::default()),
            InstrumentType::Rsn => Kind::Rsn(RsnInstrument::default()),
            InstrumentType::Botpt => Kind::Botpt(BotptInstrument::default()),
        };

        let mut conn = Self {
            kind,
            state: State::Unconfigured,
        };

        conn.sync_config(config);
        conn
    }

    pub fn kind_tag(&self) -> InstrumentType {
        match self.kind {
            Kind::Tcp(_) => InstrumentType::Tcp,
            Kind::Serial(_) => InstrumentType::Serial,
            Kind::Rsn(_) => InstrumentType::Rsn,
            Kind::Botpt(_) => InstrumentType::Botpt,
        }
    }

    /// Push the instrument-side settings from the config record into the
    /// links. Changing the endpoint of a live link drops it (the link
    /// enforces that), which lands us in `Disconnected` for the reconnect
    /// timer to pick up.
    pub fn sync_config(&mut self, config: &PortAgentConfig) {
        let host = config.instrument_data_host.as_deref();

        match &mut self.kind {
            Kind::Tcp(tcp) => {
                if let Some(host) = host {
                    tcp.data.set_host(host);
                }
                tcp.data.set_port(config.instrument_data_port);
            },
            Kind::Serial(serial) => {
                if let Some(path) = config.device_path.as_deref() {
                    serial.port.set_path(path);
                }
                serial.port.set_baud(config.baud);
            },
            Kind::Rsn(rsn) => {
                if let Some(host) = host {
                    rsn.data.set_host(host);
                    rsn.command.set_host(host);
                }
                rsn.data.set_port(config.instrument_data_port);
                rsn.command.set_port(config.instrument_command_port);
            },
            Kind::Botpt(botpt) => {
                if let Some(host) = host {
                    botpt.data.set_host(host);
                    botpt.command.set_host(host);
                }
                botpt.data.set_port(config.instrument_data_port);
                botpt.command.set_port(config.instrument_command_port);
            },
        }

        self.state = match (self.configured(), self.connected()) {
            (false, _) => State::Unconfigured,
            (true, true) => self.state,
            (true, false) => match self.state {
                State::Unconfigured | State::Configured => State::Configured,
                _ => State::Disconnected,
            },
        };
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn configured(&self) -> bool {
        match &self.kind {
            Kind::Tcp(tcp) => tcp.data.configured(),
            Kind::Serial(serial) => serial.port.configured(),
            Kind::Rsn(rsn) => rsn.data.configured() && rsn.command.configured(),
            Kind::Botpt(botpt) => botpt.data.configured() && botpt.command.configured(),
        }
    }

    pub fn initialized(&self) -> bool {
        matches!(self.state, State::Initializing | State::Ready)
    }

    /// Data-path connectivity. For RSN this is deliberately the data socket
    /// alone: the command socket is opened per command and is not expected
    /// to stay up.
    pub fn connected(&self) -> bool {
        match &self.kind {
            Kind::Tcp(tcp) => tcp.data.connected(),
            Kind::Serial(serial) => serial.port.connected(),
            Kind::Rsn(rsn) => rsn.data.connected(),
            Kind::Botpt(botpt) => botpt.data.connected(),
        }
    }

    /// Whether the read arm of the event loop should watch this connection.
    pub fn wants_read(&self) -> bool {
        matches!(self.state, State::Initializing | State::Ready)
    }

    pub async fn initialize(&mut self, connect_timeout: Duration) -> Result<(), net::Error> {
        if !self.configured() {
            self.state = State::Unconfigured;
            return Err(net::Error::MissingConfig("instrument endpoint"));
        }

        // Only bring up what is down; a live socket is left alone.
        if self.connected() && !matches!(&self.kind, Kind::Rsn(rsn) if rsn.handshaking()) {
            self.state = State::Ready;
            return Ok(());
        }

        self.state = State::Initializing;

        let result = match &mut self.kind {
            Kind::Tcp(tcp) => tcp.data.connect(connect_timeout).await,
            Kind::Serial(serial) => serial.port.open(),
            Kind::Rsn(rsn) => rsn.begin(connect_timeout).await,
            Kind::Botpt(botpt) => match botpt.data.connect(connect_timeout).await {
                Ok(()) => botpt.command.connect(connect_timeout).await,
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => {
                // RSN stays in Initializing until the DIGI handshake lands.
                if !matches!(&self.kind, Kind::Rsn(rsn) if rsn.handshaking()) {
                    self.state = State::Ready;
                }
                Ok(())
            },
            Err(e) => {
                self.disconnect();
                Err(e)
            },
        }
    }

    pub fn disconnect(&mut self) {
        match &mut self.kind {
            Kind::Tcp(tcp) => tcp.data.disconnect(),
            Kind::Serial(serial) => serial.port.close(),
            Kind::Rsn(rsn) => rsn.abort(),
            Kind::Botpt(botpt) => {
                botpt.data.disconnect();
                botpt.command.disconnect();
            },
        }

        self.state = if self.configured() {
            State::Disconnected
        } else {
            State::Unconfigured
        };
    }

    /// Wait for instrument-side traffic. Pends while there is nothing to
    /// watch, so it parks safely in a `select!` arm.
    pub async fn read_event(&mut self) -> ConnEvent {
        match &mut self.kind {
            Kind::Tcp(tcp) => match tcp.data.read_chunk().await {
                Chunk::Data(bytes) => ConnEvent::Data(bytes),
                Chunk::Closed => {
                    self.state = State::Disconnected;
                    ConnEvent::Closed
                },
            },
            Kind::Serial(serial) => match serial.port.read_chunk().await {
                Chunk::Data(bytes) => ConnEvent::Data(bytes),
                Chunk::Closed => {
                    self.state = State::Disconnected;
                    ConnEvent::Closed
                },
            },
            Kind::Botpt(botpt) => match botpt.data.read_chunk().await {
                Chunk::Data(bytes) => ConnEvent::Data(bytes),
                Chunk::Closed => {
                    botpt.command.disconnect();
                    self.state = State::Disconnected;
                    ConnEvent::Closed
                },
            },
            Kind::Rsn(rsn) => {
                if rsn.handshaking() {
                    let from_command = tokio::select! {
                        chunk = rsn.command.read_chunk() => Some(chunk),
                        chunk = rsn.data.read_chunk() => {
                            match chunk {
                                Chunk::Data(bytes) => return ConnEvent::Data(bytes),
                                Chunk::Closed => {
                                    rsn.abort();
                                    self.state = State::Disconnected;
                                    return ConnEvent::Closed;
                                },
                            }
                        },
                    };

                    match from_command.map(|chunk| rsn.on_command_chunk(chunk)) {
                        Some(Some(Ok(()))) => {
                            self.state = State::Ready;
                            ConnEvent::HandshakeComplete
                        },
                        Some(Some(Err(reason))) => {
                            rsn.abort();
                            self.state = State::Disconnected;
                            ConnEvent::HandshakeFailed(reason)
                        },
                        _ => ConnEvent::Idle,
                    }
                } else {
                    match rsn.data.read_chunk().await {
                        Chunk::Data(bytes) => ConnEvent::Data(bytes),
                        Chunk::Closed => {
                            rsn.abort();
                            self.state = State::Disconnected;
                            ConnEvent::Closed
                        },
                    }
                }
            },
        }
    }

    /// Expire any pending handshake deadline; called from the timer tick.
    pub fn poll_deadlines(&mut self, now: Instant) -> Option<ConnEvent> {
        if let Kind::Rsn(rsn) = &mut self.kind {
            if let Some(reason) = rsn.check_deadline(now) {
                rsn.abort();
                self.state = State::Disconnected;
                return Some(ConnEvent::HandshakeFailed(reason));
            }
        }

        None
    }

    /// Relay driver bytes to the instrument.
    pub fn write_data(&mut self, buf: &[u8]) -> bool {
        match &mut self.kind {
            Kind::Tcp(tcp) => tcp.data.try_write(buf),
            Kind::Serial(serial) => serial.port.try_write(buf),
            Kind::Rsn(rsn) => rsn.data.try_write(buf),
            Kind::Botpt(botpt) => botpt.command.try_write(buf),
        }
    }

    /// Sink handle for the instrument-data publisher.
    pub fn write_handle(&self) -> Option<SinkHandle> {
        match &self.kind {
            Kind::Tcp(tcp) => tcp.data.write_handle(),
            Kind::Serial(serial) => serial.port.write_handle(),
            Kind::Rsn(rsn) => rsn.data.write_handle(),
            Kind::Botpt(botpt) => botpt.command.write_handle(),
        }
    }

    /// Sink handle for the instrument-command publisher, where a persistent
    /// command socket exists.
    pub fn command_handle(&self) -> Option<SinkHandle> {
        match &self.kind {
            Kind::Botpt(botpt) => botpt.command.write_handle(),
            _ => None,
        }
    }

    pub async fn send_break(&mut self, millis: u32) -> bool {
        match &mut self.kind {
            Kind::Rsn(rsn) => match rsn.send_break(millis).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(error = %e, "break failed");
                    false
                },
            },
            Kind::Botpt(botpt) => botpt.command.try_write(format!("break {millis}\n").as_bytes()),
            _ => {
                tracing::warn!("break not supported on this connection type");
                false
            },
        }
    }

    /// Inject raw command bytes on the instrument's command channel.
    pub async fn send_command(&mut self, command: &[u8]) -> bool {
        match &mut self.kind {
            Kind::Rsn(rsn) => match rsn.send_command(command).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(error = %e, "instrument command failed");
                    false
                },
            },
            Kind::Botpt(botpt) => botpt.command.try_write(command),
            _ => {
                tracing::warn!("no command channel on this connection type");
                false
            },
        }
    }
}
