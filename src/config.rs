use std::{
    fmt::Write as _,
    io,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unrecognized command: {0}")]
    UnknownCommand(String),

    #[error("bad argument for {command}: {reason}")]
    BadArgument {
        command: &'static str,
        reason:  String,
    },

    #[error("reading config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("writing config file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, derive_more::Display)]
pub enum InstrumentType {
    #[display(fmt = "tcp")]
    Tcp,
    #[display(fmt = "serial")]
    Serial,
    #[display(fmt = "rsn")]
    Rsn,
    #[display(fmt = "botpt")]
    Botpt,
}

impl FromStr for InstrumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "serial" => Ok(Self::Serial),
            "rsn" => Ok(Self::Rsn),
            "botpt" => Ok(Self::Botpt),
            other => Err(format!("unknown instrument type {other:?}")),
        }
    }
}

/// Everything the agent can be told about its world. Mutated at runtime by
/// the config-port command language; `save` writes it back out in the same
/// language.
#[derive(Debug, Clone)]
pub struct PortAgentConfig {
    pub instrument_type:         InstrumentType,
    pub instrument_data_host:    Option<String>,
    pub instrument_data_port:    u16,
    pub instrument_command_port: u16,
    pub device_path:             Option<String>,
    pub baud:                    u32,

    pub data_port:    u16,
    pub command_port: u16,
    pub sniffer_port: u16,
    /// Operator/telnet port; set from the command line, not the command
    /// language.
    pub config_port:  u16,

    pub log_dir:  PathBuf,
    pub pid_file: PathBuf,

    pub heartbeat_interval: Duration,
    pub max_packet_size:    usize,
    pub flush_interval:     Duration,

    pub config_file: Option<PathBuf>,
}

impl Default for PortAgentConfig {
    fn default() -> Self {
        Self {
            instrument_type:         InstrumentType::Tcp,
            instrument_data_host:    None,
            instrument_data_port:    0,
            instrument_command_port: 0,
            device_path:             None,
            baud:                    9600,

            data_port:    0,
            command_port: 0,
            sniffer_port: 0,
            config_port:  0,

            log_dir:  PathBuf::from("/var/tmp/portagent"),
            pid_file: PathBuf::from("/var/tmp/portagent.pid"),

            heartbeat_interval: Duration::from_secs(15),
            max_packet_size:    4096,
            flush_interval:     Duration::from_millis(40),

            config_file: None,
        }
    }
}

/// One parsed line of the command language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    InstrumentType(InstrumentType),
    InstrumentDataHost(String),
    InstrumentDataPort(u16),
    InstrumentCommandPort(u16),
    DevicePath(String),
    Baud(u32),
    DataPort(u16),
    CommandPort(u16),
    SnifferPort(u16),
    LogDir(PathBuf),
    HeartbeatInterval(u64),
    MaxPacketSize(usize),
    Break(u32),
    Get(String),
    Save,
    Shutdown,
}

/// What the agent has to do after applying a directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Quiet,
    RebindData(u16),
    RebindCommand(u16),
    RebindSniffer(u16),
    InstrumentChanged,
    MaxPacketSizeChanged(usize),
    Reply(String),
    SendBreak(u32),
    Save,
    Shutdown,
}

fn num<T: FromStr>(command: &'static str, arg: Option<&str>) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let raw = arg.ok_or(ConfigError::BadArgument {
        command,
        reason: "missing argument".into(),
    })?;

    raw.parse().map_err(|e: T::Err| ConfigError::BadArgument {
        command,
        reason: e.to_string(),
    })
}

impl Directive {
    /// Parse one line. Blank lines and `#` comments parse to `None`.
    pub fn parse(line: &str) -> Result<Option<Directive>, ConfigError> {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let arg = words.next();

        let directive = match command {
            "instrument_type" => Directive::InstrumentType(
                arg.ok_or(ConfigError::BadArgument {
                    command: "instrument_type",
                    reason:  "missing argument".into(),
                })?
                .parse()
                .map_err(|reason| ConfigError::BadArgument {
                    command: "instrument_type",
                    reason,
                })?,
            ),
            "instrument_data_host" => {
                Directive::InstrumentDataHost(
                    arg.ok_or(ConfigError::BadArgument {
                        command: "instrument_data_host",
                        reason:  "missing argument".into(),
                    })?
                    .to_owned(),
                )
            },
            "instrument_data_port" => {
                Directive::InstrumentDataPort(num("instrument_data_port", arg)?)
            },
            "instrument_command_port" => {
                Directive::InstrumentCommandPort(num("instrument_command_port", arg)?)
            },
            "device_path" => Directive::DevicePath(
                arg.ok_or(ConfigError::BadArgument {
                    command: "device_path",
                    reason:  "missing argument".into(),
                })?
                .to_owned(),
            ),
            "baud" => Directive::Baud(num("baud", arg)?),
            "data_port" => Directive::DataPort(num("data_port", arg)?),
            "command_port" => Directive::CommandPort(num("command_port", arg)?),
            "sniffer_port" => Directive::SnifferPort(num("sniffer_port", arg)?),
            "log_dir" => Directive::LogDir(
                arg.ok_or(ConfigError::BadArgument {
                    command: "log_dir",
                    reason:  "missing argument".into(),
                })?
                .into(),
            ),
            "heartbeat_interval" => Directive::HeartbeatInterval(num("heartbeat_interval", arg)?),
            "max_packet_size" => Directive::MaxPacketSize(num("max_packet_size", arg)?),
            "break" => Directive::Break(match arg {
                Some(_) => num("break", arg)?,
                None => 0,
            }),
            "get" => Directive::Get(
                arg.ok_or(ConfigError::BadArgument {
                    command: "get",
                    reason:  "missing field name".into(),
                })?
                .to_owned(),
            ),
            "save" => Directive::Save,
            "shutdown" => Directive::Shutdown,
            other => return Err(ConfigError::UnknownCommand(other.to_owned())),
        };

        Ok(Some(directive))
    }
}

impl PortAgentConfig {
    pub fn apply(&mut self, directive: &Directive) -> Applied {
        match directive {
            Directive::InstrumentType(ty) => {
                self.instrument_type = *ty;
                Applied::InstrumentChanged
            },
            Directive::InstrumentDataHost(host) => {
                self.instrument_data_host = Some(host.clone());
                Applied::InstrumentChanged
            },
            Directive::InstrumentDataPort(port) => {
                self.instrument_data_port = *port;
                Applied::InstrumentChanged
            },
            Directive::InstrumentCommandPort(port) => {
                self.instrument_command_port = *port;
                Applied::InstrumentChanged
            },
            Directive::DevicePath(path) => {
                self.device_path = Some(path.clone());
                Applied::InstrumentChanged
            },
            Directive::Baud(baud) => {
                self.baud = *baud;
                Applied::InstrumentChanged
            },
            Directive::DataPort(port) => {
                self.data_port = *port;
                Applied::RebindData(*port)
            },
            Directive::CommandPort(port) => {
                self.command_port = *port;
                Applied::RebindCommand(*port)
            },
            Directive::SnifferPort(port) => {
                self.sniffer_port = *port;
                Applied::RebindSniffer(*port)
            },
            Directive::LogDir(dir) => {
                self.log_dir = dir.clone();
                Applied::Quiet
            },
            Directive::HeartbeatInterval(secs) => {
                self.heartbeat_interval = Duration::from_secs(*secs);
                Applied::Quiet
            },
            Directive::MaxPacketSize(bytes) => {
                self.max_packet_size = *bytes;
                Applied::MaxPacketSizeChanged(*bytes)
            },
            Directive::Break(millis) => Applied::SendBreak(*millis),
            Directive::Get(field) => match self.get(field) {
                Some(value) => Applied::Reply(format!("{field} {value}")),
                None => Applied::Reply(format!("{field} <unknown field>")),
            },
            Directive::Save => Applied::Save,
            Directive::Shutdown => Applied::Shutdown,
        }
    }

    pub fn get(&self, field: &str) -> Option<String> {
        let value = match field {
            "instrument_type" => self.instrument_type.to_string(),
            "instrument_data_host" => self.instrument_data_host.clone().unwrap_or_default(),
            "instrument_data_port" => self.instrument_data_port.to_string(),
            "instrument_command_port" => self.instrument_command_port.to_string(),
            "device_path" => self.device_path.clone().unwrap_or_default(),
            "baud" => self.baud.to_string(),
            "data_port" => self.data_port.to_string(),
            "command_port" => self.command_port.to_string(),
            "sniffer_port" => self.sniffer_port.to_string(),
            "log_dir" => self.log_dir.display().to_string(),
            "heartbeat_interval" => self.heartbeat_interval.as_secs().to_string(),
            "max_packet_size" => self.max_packet_size.to_string(),
            _ => return None,
        };

        Some(value)
    }

    /// Render the record in the command language, one setter per line.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "instrument_type {}", self.instrument_type);

        if let Some(host) = &self.instrument_data_host {
            let _ = writeln!(out, "instrument_data_host {host}");
        }
        if self.instrument_data_port > 0 {
            let _ = writeln!(out, "instrument_data_port {}", self.instrument_data_port);
        }
        if self.instrument_command_port > 0 {
            let _ = writeln!(out, "instrument_command_port {}", self.instrument_command_port);
        }
        if let Some(path) = &self.device_path {
            let _ = writeln!(out, "device_path {path}");
        }

        let _ = writeln!(out, "baud {}", self.baud);
        let _ = writeln!(out, "data_port {}", self.data_port);
        let _ = writeln!(out, "command_port {}", self.command_port);

        if self.sniffer_port > 0 {
            let _ = writeln!(out, "sniffer_port {}", self.sniffer_port);
        }

        let _ = writeln!(out, "log_dir {}", self.log_dir.display());
        let _ = writeln!(out, "heartbeat_interval {}", self.heartbeat_interval.as_secs());
        let _ = writeln!(out, "max_packet_size {}", self.max_packet_size);

        out
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.config_file else {
            return Err(ConfigError::Write {
                path:   PathBuf::from("<unset>"),
                source: io::Error::new(io::ErrorKind::NotFound, "no config file configured"),
            });
        };

        std::fs::write(path, self.render()).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })
    }

    /// Load a saved config: parse every line and apply the setters. Action
    /// directives (`get`, `save`, `shutdown`, `break`) are not valid in a
    /// file.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        let mut config = Self {
            config_file: Some(path.to_owned()),
            ..Self::default()
        };

        for line in text.lines() {
            let Some(directive) = Directive::parse(line)? else {
                continue;
            };

            match directive {
                Directive::Break(_) | Directive::Get(_) | Directive::Save | Directive::Shutdown => {
                    return Err(ConfigError::BadArgument {
                        command: "load",
                        reason:  format!("action directive in config file: {line:?}"),
                    });
                },
                other => {
                    config.apply(&other);
                },
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_setters() {
        assert_eq!(
            Directive::parse("instrument_type rsn").unwrap(),
            Some(Directive::InstrumentType(InstrumentType::Rsn))
        );
        assert_eq!(
            Directive::parse("data_port 4001").unwrap(),
            Some(Directive::DataPort(4001))
        );
        assert_eq!(
            Directive::parse("  heartbeat_interval 5 ").unwrap(),
            Some(Directive::HeartbeatInterval(5))
        );
        assert_eq!(Directive::parse("shutdown").unwrap(), Some(Directive::Shutdown));
    }

    #[test]
    fn parse_ignores_blank_and_comments() {
        assert_eq!(Directive::parse("").unwrap(), None);
        assert_eq!(Directive::parse("   ").unwrap(), None);
        assert_eq!(Directive::parse("# data_port 1").unwrap(), None);
    }

    #[test]
    fn parse_rejects_junk() {
        assert!(matches!(
            Directive::parse("fire_the_laser"),
            Err(ConfigError::UnknownCommand(_))
        ));
        assert!(matches!(
            Directive::parse("data_port banana"),
            Err(ConfigError::BadArgument { .. })
        ));
        assert!(matches!(
            Directive::parse("instrument_type x25"),
            Err(ConfigError::BadArgument { .. })
        ));
    }

    #[test]
    fn apply_reports_side_effects() {
        let mut config = PortAgentConfig::default();

        assert_eq!(
            config.apply(&Directive::DataPort(9999)),
            Applied::RebindData(9999)
        );
        assert_eq!(config.data_port, 9999);

        assert_eq!(
            config.apply(&Directive::InstrumentDataHost("10.0.0.5".into())),
            Applied::InstrumentChanged
        );

        assert_eq!(
            config.apply(&Directive::MaxPacketSize(1024)),
            Applied::MaxPacketSizeChanged(1024)
        );

        assert_eq!(config.apply(&Directive::Shutdown), Applied::Shutdown);
    }

    #[test]
    fn get_known_and_unknown_fields() {
        let mut config = PortAgentConfig::default();
        config.apply(&Directive::CommandPort(4002));

        assert_eq!(
            config.apply(&Directive::Get("command_port".into())),
            Applied::Reply("command_port 4002".into())
        );
        assert_eq!(
            config.apply(&Directive::Get("warp_core".into())),
            Applied::Reply("warp_core <unknown field>".into())
        );
    }

    #[test]
    fn render_round_trips_through_parse() {
        let mut config = PortAgentConfig::default();
        config.apply(&Directive::InstrumentType(InstrumentType::Rsn));
        config.apply(&Directive::InstrumentDataHost("digi.local".into()));
        config.apply(&Directive::InstrumentDataPort(2101));
        config.apply(&Directive::InstrumentCommandPort(2102));
        config.apply(&Directive::DataPort(4001));
        config.apply(&Directive::CommandPort(4002));
        config.apply(&Directive::HeartbeatInterval(7));

        let mut reread = PortAgentConfig::default();
        for line in config.render().lines() {
            let directive = Directive::parse(line).unwrap().unwrap();
            reread.apply(&directive);
        }

        assert_eq!(reread.instrument_type, InstrumentType::Rsn);
        assert_eq!(reread.instrument_data_host.as_deref(), Some("digi.local"));
        assert_eq!(reread.instrument_data_port, 2101);
        assert_eq!(reread.instrument_command_port, 2102);
        assert_eq!(reread.data_port, 4001);
        assert_eq!(reread.command_port, 4002);
        assert_eq!(reread.heartbeat_interval, Duration::from_secs(7));
    }
}
