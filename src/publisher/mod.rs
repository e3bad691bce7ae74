//! Fan-out sinks. Each publisher advertises the packet types it accepts and
//! a projection (binary frame, ascii, or bare payload); the list walks them
//! in insertion order. Publishers never own their sinks: socket sinks are
//! weak handles into the connection layer or the agent's listeners, so a
//! closed socket shows up as a dead handle and the publisher goes quietly
//! inactive.

use std::{
    fs,
    io::{
        self,
        Write as _,
    },
    path::{
        Path,
        PathBuf,
    },
};

use packet::{
    Packet,
    PacketType,
};

use net::SinkHandle;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publisher write failure ({role}): {source}")]
    Write {
        role:   Role,
        source: io::Error,
    },

    #[error("log file write failure ({path}): {source}")]
    Log { path: PathBuf, source: io::Error },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Role {
    #[display(fmt = "driver data")]
    DriverData,
    #[display(fmt = "driver command")]
    DriverCommand,
    #[display(fmt = "instrument data")]
    InstrumentData,
    #[display(fmt = "instrument command")]
    InstrumentCommand,
    #[display(fmt = "log file")]
    LogFile,
    #[display(fmt = "data listener")]
    TcpDataListener,
}

#[derive(Debug)]
pub struct SinkSlot {
    sink:   SinkHandle,
    active: bool,
}

impl SinkSlot {
    fn new(sink: SinkHandle) -> Self {
        Self {
            sink,
            active: true,
        }
    }

    fn send(&mut self, role: Role, bytes: &[u8]) -> Result<(), PublishError> {
        if !self.active {
            return Ok(());
        }

        let Some(sink) = self.sink.upgrade() else {
            // Sink owner closed it; nothing to report.
            self.active = false;
            return Ok(());
        };

        let mut buf = bytes;

        while !buf.is_empty() {
            match sink.try_send(buf) {
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Kernel buffer full: slow consumer. Drop this packet for
                    // this sink rather than stalling the pipeline.
                    tracing::warn!(%role, "sink backlogged, dropping packet");
                    return Ok(());
                },
                Err(source) => {
                    self.active = false;
                    return Err(PublishError::Write {
                        role,
                        source,
                    });
                },
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct LogSlot {
    file:   fs::File,
    path:   PathBuf,
    active: bool,
}

#[derive(Debug)]
pub enum Publisher {
    DriverData(SinkSlot),
    DriverCommand(SinkSlot),
    InstrumentData(SinkSlot),
    InstrumentCommand(SinkSlot),
    TcpDataListener(SinkSlot),
    LogFile(LogSlot),
}

impl Publisher {
    pub fn driver_data(sink: SinkHandle) -> Self {
        Self::DriverData(SinkSlot::new(sink))
    }

    pub fn driver_command(sink: SinkHandle) -> Self {
        Self::DriverCommand(SinkSlot::new(sink))
    }

    pub fn instrument_data(sink: SinkHandle) -> Self {
        Self::InstrumentData(SinkSlot::new(sink))
    }

    pub fn instrument_command(sink: SinkHandle) -> Self {
        Self::InstrumentCommand(SinkSlot::new(sink))
    }

    pub fn tcp_data_listener(sink: SinkHandle) -> Self {
        Self::TcpDataListener(SinkSlot::new(sink))
    }

    pub fn log_file(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;

        let path = dir.join("portagent.log");
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self::LogFile(LogSlot {
            file,
            path,
            active: true,
        }))
    }

    pub fn role(&self) -> Role {
        match self {
            Publisher::DriverData(_) => Role::DriverData,
            Publisher::DriverCommand(_) => Role::DriverCommand,
            Publisher::InstrumentData(_) => Role::InstrumentData,
            Publisher::InstrumentCommand(_) => Role::InstrumentCommand,
            Publisher::TcpDataListener(_) => Role::TcpDataListener,
            Publisher::LogFile(_) => Role::LogFile,
        }
    }

    /// The accepted-type matrix.
    pub fn accepts(&self, ty: PacketType) -> bool {
        use PacketType::*;

        match self {
            Publisher::DriverData(_) => matches!(
                ty,
                DataFromInstrument | DataFromRsn | PortAgentStatus | PortAgentFault
                    | PortAgentHeartbeat
            ),
            Publisher::DriverCommand(_) => {
                matches!(ty, PortAgentCommand | PortAgentStatus | PortAgentFault)
            },
            Publisher::InstrumentData(_) => matches!(ty, DataFromDriver),
            Publisher::InstrumentCommand(_) => matches!(ty, InstrumentCommand),
            Publisher::TcpDataListener(_) => matches!(ty, DataFromInstrument | DataFromRsn),
            Publisher::LogFile(_) => true,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Publisher::DriverData(slot)
            | Publisher::DriverCommand(slot)
            | Publisher::InstrumentData(slot)
            | Publisher::InstrumentCommand(slot)
            | Publisher::TcpDataListener(slot) => slot.active,
            Publisher::LogFile(slot) => slot.active,
        }
    }

    /// Publish one packet. Non-accepted types succeed without I/O.
    pub fn publish(&mut self, packet: &Packet) -> Result<(), PublishError> {
        if !self.accepts(packet.packet_type()) {
            return Ok(());
        }

        let role = self.role();

        match self {
            // Driver-facing sinks get the full binary frame.
            Publisher::DriverData(slot) | Publisher::DriverCommand(slot) => {
                slot.send(role, packet.as_bytes())
            },

            // Instrument-facing sinks and the sniffer tap get bare payload.
            Publisher::InstrumentData(slot)
            | Publisher::InstrumentCommand(slot)
            | Publisher::TcpDataListener(slot) => slot.send(role, packet.payload()),

            Publisher::LogFile(slot) => {
                if !slot.active {
                    return Ok(());
                }

                slot.file.write_all(&packet.ascii()).map_err(|source| {
                    slot.active = false;
                    PublishError::Log {
                        path: slot.path.clone(),
                        source,
                    }
                })
            },
        }
    }
}

/// Insertion-ordered set of publishers, one per role.
#[derive(Debug, Default)]
pub struct PublisherList {
    items: Vec<Publisher>,
}

impl PublisherList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a publisher, replacing any existing one of the same role in
    /// place (keeping its position in the fan-out order).
    pub fn upsert(&mut self, publisher: Publisher) {
        match self.items.iter_mut().find(|p| p.role() == publisher.role()) {
            Some(slot) => *slot = publisher,
            None => self.items.push(publisher),
        }
    }

    pub fn remove(&mut self, role: Role) {
        self.items.retain(|p| p.role() != role);
    }

    pub fn get(&self, role: Role) -> Option<&Publisher> {
        self.items.iter().find(|p| p.role() == role)
    }

    /// Broadcast one packet in insertion order, collecting per-sink
    /// failures. A failed sink does not stop the walk.
    pub fn publish_all(&mut self, packet: &Packet) -> Vec<PublishError> {
        let mut failures = Vec::new();

        for publisher in &mut self.items {
            if let Err(e) = publisher.publish(packet) {
                tracing::warn!(error = %e, "publish failed");
                failures.push(e);
            }
        }

        failures
    }
}
