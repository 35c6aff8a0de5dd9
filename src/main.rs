use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};

use deskstream::config::{Configuration, ConfigFile};
use deskstream::error::Result;
use deskstream::session;
use deskstream::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Controller,
    Controllee,
}

/// Remote desktop streaming and control: tiled change-detection capture,
/// length-framed transport, adaptive quality control.
#[derive(Debug, Parser)]
#[command(name = "deskstream")]
struct Cli {
    /// Role this process plays on the connection.
    mode: Mode,

    /// Connect to this address instead of listening for a peer.
    #[arg(long)]
    host: Option<String>,

    /// TCP port to connect to or listen on.
    #[arg(long, default_value_t = 5005)]
    port: u16,

    /// TOML file of startup configuration defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Raise logging verbosity; repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

fn run(cli: Cli) -> Result<()> {
    let config_file = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    let config = Configuration::from_file_opt(config_file);

    let transport = match &cli.host {
        Some(host) => Transport::connect(host, cli.port)?,
        None => Transport::listen_and_accept(cli.port)?,
    };
    let transport = Arc::new(transport);

    let signal_transport = transport.clone();
    ctrlc::set_handler(move || {
        log::info!("received Ctrl-C, shutting down");
        signal_transport.stop();
    })
    .expect("failed to install Ctrl-C handler");

    match cli.mode {
        Mode::Controllee => session::run_controllee(transport, config),
        Mode::Controller => session::run_controller(transport),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("{}", error);
            ExitCode::FAILURE
        }
    }
}
