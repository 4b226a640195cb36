//! tandem: two-process counter rendezvous.
//!
//! # Usage
//!
//! ```sh
//! tandem owner &           # creates the segment and gates, then waits
//! tandem peer              # attaches, both count to 2 * quota
//! tandem status            # lists names left behind by a killed run
//! tandem purge             # removes them
//! ```
//!
//! Both sides must agree on `--prefix`, `--key-path`, `--salt` and `--shape`.
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: abandon the run, release resources, exit 1

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use tandem::{Config, Report, Session, Shape, Shutdown, TandemError, stale};

#[derive(Parser)]
#[command(name = "tandem", version, about = "Two-process counter rendezvous over POSIX IPC")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Prefix for every shared memory and semaphore name
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Existing path whose device/inode numbers seed the segment key
    #[arg(long, global = true)]
    key_path: Option<PathBuf>,

    /// Salt mixed into the segment key
    #[arg(long, global = true)]
    salt: Option<u8>,

    /// Increments per participant
    #[arg(long, global = true)]
    quota: Option<u64>,

    /// Gate layout
    #[arg(long, global = true, value_enum)]
    shape: Option<Shape>,

    /// How long the peer retries while the owner is not up yet (0: once)
    #[arg(long, global = true)]
    attach_timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the resources, run the protocol, remove the resources
    Owner,
    /// Attach to a running owner and run the protocol
    Peer,
    /// List segment and gate names that currently exist
    Status,
    /// Remove segment and gate names left behind by an earlier run
    Purge,
}

impl Cli {
    fn resolve_config(&self) -> Result<Config, TandemError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(prefix) = &self.prefix {
            config.prefix.clone_from(prefix);
        }
        if let Some(key_path) = &self.key_path {
            config.key_path.clone_from(key_path);
        }
        if let Some(salt) = self.salt {
            config.salt = salt;
        }
        if let Some(quota) = self.quota {
            config.quota = quota;
        }
        if let Some(shape) = self.shape {
            config.shape = shape;
        }
        if let Some(ms) = self.attach_timeout_ms {
            config.attach_timeout_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    tandem::init_tracing();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("tandem: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: &Cli) -> Result<u8, TandemError> {
    let config = cli.resolve_config()?;

    match cli.command {
        Command::Owner => {
            let shutdown = install_shutdown()?;
            let session = Session::establish_owner(config, shutdown)?;
            print_started(session.config(), "owner");
            finish(session.run()?)
        }
        Command::Peer => {
            let shutdown = install_shutdown()?;
            let session = Session::attach_peer(config, shutdown)?;
            print_started(session.config(), "peer");
            finish(session.run()?)
        }
        Command::Status => {
            let found = stale::inspect(&config)?;
            if found.is_empty() {
                println!("no resources for prefix `{}`", config.prefix);
            }
            for resource in &found {
                println!("{resource}");
            }
            Ok(0)
        }
        Command::Purge => {
            let removed = stale::purge(&config)?;
            for resource in &removed {
                println!("removed {resource}");
            }
            println!("{} resource(s) removed", removed.len());
            Ok(0)
        }
    }
}

fn install_shutdown() -> Result<Shutdown<'static>, TandemError> {
    Shutdown::install()
        .map_err(|errno| TandemError::Config(format!("cannot install signal handlers: {errno}")))
}

fn print_started(config: &Config, role: &str) {
    println!(
        "{role} started. quota = {:>10} shape = {:?}",
        config.quota, config.shape
    );
}

fn finish(report: Report) -> Result<u8, TandemError> {
    println!("{report}");
    Ok(report.exit_code() as u8)
}
