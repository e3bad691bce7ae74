use std::{
    fs,
    path::Path,
    process::exit,
};

use structopt::StructOpt as _;
use tap::Pipe as _;
use tracing_subscriber::EnvFilter;

use portagent::{
    build,
    config::PortAgentConfig,
    PortAgent,
};

pub use crate::options::Options;

mod options;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;
const EXIT_RUNNING: i32 = 3;

fn main() {
    let options = Options::from_args();

    trace_init(options.verbose);

    tracing::info!(
        application = build::PACKAGE,
        version = build::VERSION,
        build_commit = build::COMMIT_HASH,
        built_at = build::BUILD_TIMESTAMP,
        using_rustc = build::RUSTC_COMMIT_HASH,
        "starting up"
    );

    let mut config = match &options.config_file {
        Some(path) => match PortAgentConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "loading configuration");
                exit(EXIT_CONFIG);
            },
        },
        None => PortAgentConfig::default(),
    };

    config.config_port = options.config_port;

    if options.kill {
        exit(match kill_running(&config.pid_file) {
            true => EXIT_OK,
            false => EXIT_CONFIG,
        });
    }

    if !options.single {
        if let Some(pid) = read_pid(&config.pid_file) {
            if pid_alive(pid) {
                tracing::error!(pid, "an instance is already running");
                exit(EXIT_RUNNING);
            }
        }

        if let Err(e) = fs::write(&config.pid_file, format!("{}\n", std::process::id())) {
            tracing::error!(error = %e, path = %config.pid_file.display(), "writing pid file");
            exit(EXIT_CONFIG);
        }
    }

    let pid_file = (!options.single).then(|| config.pid_file.clone());

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "building runtime");
            exit(EXIT_CONFIG);
        },
    };

    let code = runtime.block_on(async move {
        let mut agent = match PortAgent::new(config).await {
            Ok(agent) => agent,
            Err(e) => {
                tracing::error!(error = %e, "binding observatory ports");
                return EXIT_BIND;
            },
        };

        match agent.run().await {
            Ok(()) => EXIT_OK,
            Err(e) => {
                tracing::error!(error = %e, "event loop failed");
                EXIT_CONFIG
            },
        }
    });

    if let Some(path) = pid_file {
        let _ = fs::remove_file(path);
    }

    exit(code);
}

fn trace_init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        match verbose {
            true => "debug",
            false => "info",
        }
        .pipe(EnvFilter::new)
    });

    tracing_subscriber::fmt().with_writer(std::io::stderr).with_env_filter(filter).init();
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

fn kill_running(pid_file: &Path) -> bool {
    let Some(pid) = read_pid(pid_file) else {
        tracing::error!(path = %pid_file.display(), "no pid file; nothing to kill");
        return false;
    };

    tracing::info!(pid, "stopping running instance");

    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        tracing::error!(pid, error = %std::io::Error::last_os_error(), "kill failed");
        return false;
    }

    true
}
