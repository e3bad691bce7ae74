use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, structopt::StructOpt)]
#[structopt(name = "portagent", about = "instrument/driver mediation daemon")]
pub struct Options {
    /// Observatory configuration (telnet) port.
    #[structopt(short = "p", long = "port")]
    pub config_port: u16,

    /// Configuration file, in the config-port command language.
    #[structopt(short = "c", long = "conf")]
    pub config_file: Option<PathBuf>,

    /// Verbose logging (debug level).
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Kill a running instance via its pid file, then exit.
    #[structopt(short = "k", long = "kill")]
    pub kill: bool,

    /// Single-shot: run in the foreground without pid-file bookkeeping.
    #[structopt(short = "s", long = "single")]
    pub single: bool,
}
