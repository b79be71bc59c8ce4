//! Command-line front-end: discovery, one-shot reads and writes, and watching a
//! device through the poller.
//!
//! Results go to stdout as JSON; logs go to stderr.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use modbus_poller::api::LocalApi;
use modbus_poller::config::PollerConfig;
use modbus_poller::connection::ConnectionManager;
use modbus_poller::discovery::Scanner;
use modbus_poller::request::{ConnectParams, DataKind};
use modbus_poller::simulator::SimulatedLab;
use tracing::{debug, info, warn};

/// Environment variable naming a configuration file.
const CONFIG_ENV: &str = "MODBUS_POLLER_CONFIG";

#[derive(Parser, Debug)]
#[command(
    name = "modbus-poller",
    about = "Discover, read, write and poll Modbus TCP devices",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info", global = true)]
    log_level: String,

    /// Talk to in-memory devices at 10.0.0.5 and 10.0.0.7 instead of the network.
    #[arg(long, short = 's', global = true)]
    simulated: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the local /24 networks for Modbus TCP endpoints
    Scan(ScanArgs),

    /// Open a session and print the device key
    Connect(EndpointArgs),

    /// Read a block of coils, discrete inputs or registers
    Read(ReadArgs),

    /// Write a single coil
    #[command(name = "write-coil")]
    WriteCoil(WriteCoilArgs),

    /// Write a single holding register
    #[command(name = "write-register")]
    WriteRegister(WriteRegisterArgs),

    /// Poll a block periodically and print every sample
    Watch(WatchArgs),
}

#[derive(ClapArgs, Debug, Clone)]
struct EndpointArgs {
    /// Device host name or IP address
    host: String,

    #[arg(long, default_value_t = 502)]
    port: i64,

    #[arg(long, short = 'u', default_value_t = 1)]
    unit_id: i64,
}

impl From<&EndpointArgs> for ConnectParams {
    fn from(args: &EndpointArgs) -> Self {
        Self {
            host: args.host.clone(),
            port: args.port,
            unit_id: args.unit_id,
        }
    }
}

#[derive(ClapArgs, Debug)]
struct ScanArgs {
    /// Per-host probe timeout in milliseconds (100 to 5000)
    #[arg(long, short = 't')]
    timeout_ms: Option<i64>,

    /// Probe only this /24 prefix, e.g. `192.168.1`
    #[arg(long)]
    subnet: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Kind {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl From<Kind> for DataKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Coils => DataKind::Coils,
            Kind::DiscreteInputs => DataKind::DiscreteInputs,
            Kind::HoldingRegisters => DataKind::HoldingRegisters,
            Kind::InputRegisters => DataKind::InputRegisters,
        }
    }
}

#[derive(ClapArgs, Debug)]
struct ReadArgs {
    #[arg(value_enum)]
    kind: Kind,

    #[command(flatten)]
    endpoint: EndpointArgs,

    #[arg(long, short = 'a', default_value_t = 0)]
    address: i64,

    #[arg(long, short = 'n', default_value_t = 1)]
    length: i64,
}

#[derive(ClapArgs, Debug)]
struct WriteCoilArgs {
    #[command(flatten)]
    endpoint: EndpointArgs,

    #[arg(long, short = 'a')]
    address: i64,

    /// New coil state (`true` or `false`)
    #[arg(long, action = clap::ArgAction::Set)]
    state: bool,
}

#[derive(ClapArgs, Debug)]
struct WriteRegisterArgs {
    #[command(flatten)]
    endpoint: EndpointArgs,

    #[arg(long, short = 'a')]
    address: i64,

    /// New register value (0 to 65535)
    #[arg(long)]
    value: i64,
}

#[derive(ClapArgs, Debug)]
struct WatchArgs {
    #[arg(value_enum)]
    kind: Kind,

    #[command(flatten)]
    endpoint: EndpointArgs,

    #[arg(long, short = 'a', default_value_t = 0)]
    address: i64,

    #[arg(long, short = 'n', default_value_t = 1)]
    length: i64,

    /// Polling rate in milliseconds; defaults to the configured rate
    #[arg(long, short = 'r')]
    rate_ms: Option<u64>,

    /// Stop after this many samples
    #[arg(long)]
    count: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);
    debug!(version = env!("CARGO_PKG_VERSION"), "starting");

    let config = load_config(&args)?;
    let api = build_api(&config, args.simulated);

    match args.command {
        Command::Scan(scan) => commands::scan(&api, scan).await,
        Command::Connect(endpoint) => commands::connect(&api, &endpoint).await,
        Command::Read(read) => commands::read(&api, read).await,
        Command::WriteCoil(write) => commands::write_coil(&api, write).await,
        Command::WriteRegister(write) => commands::write_register(&api, write).await,
        Command::Watch(watch) => commands::watch(&api, &config, watch).await,
    }
}

/// Initialize logging to stderr; `RUST_LOG` takes precedence over `level`.
fn init_logging(level: &str) {
    let filter = format!("modbus_poller={level},modbus_poller_cli={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority:
/// 1. Command-line `--config` argument
/// 2. `MODBUS_POLLER_CONFIG` environment variable
/// 3. Built-in defaults
fn load_config(args: &Args) -> Result<PollerConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "loading config from command-line argument");
        return PollerConfig::from_file(config_path)
            .with_context(|| format!("failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "loading config from {CONFIG_ENV}");
            return PollerConfig::from_file(&config_path)
                .with_context(|| format!("failed to load config from {CONFIG_ENV}={env_path:?}"));
        }
        warn!(path = %env_path, "{CONFIG_ENV} set but file does not exist, using defaults");
    }

    Ok(PollerConfig::default())
}

fn build_api(config: &PollerConfig, simulated: bool) -> LocalApi {
    if !simulated {
        return LocalApi::tcp(config);
    }

    let lab = SimulatedLab::new(config.discovery.port);
    info!(devices = lab.devices.len(), "using simulated devices");
    let manager = ConnectionManager::new(lab.connector.clone(), config.connection.clone());
    let scanner = Scanner::new(
        lab.prober.clone(),
        Arc::new(lab.interfaces.clone()),
        config.discovery.clone(),
    );
    LocalApi::new(Arc::new(manager), scanner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn parse_read_command() {
        let args = Args::try_parse_from([
            "modbus-poller",
            "--simulated",
            "read",
            "holding-registers",
            "10.0.0.5",
            "--unit-id",
            "3",
            "-a",
            "4",
            "-n",
            "2",
        ])
        .unwrap();

        assert!(args.simulated);
        let Command::Read(read) = args.command else {
            panic!("expected read");
        };
        assert!(matches!(read.kind, Kind::HoldingRegisters));
        let params = ConnectParams::from(&read.endpoint);
        assert_eq!(params.validate().unwrap().key().as_str(), "10.0.0.5:502:3");
        assert_eq!((read.address, read.length), (4, 2));
    }

    #[test]
    fn parse_write_coil_state() {
        let args =
            Args::try_parse_from(["modbus-poller", "write-coil", "plc", "-a", "1", "--state", "false"])
                .unwrap();
        let Command::WriteCoil(write) = args.command else {
            panic!("expected write-coil");
        };
        assert!(!write.state);
    }

    #[test]
    fn explicit_config_file_is_loaded() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[discovery]\nport = 1502").unwrap();
        let args = Args::try_parse_from([
            "modbus-poller",
            "--config",
            file.path().to_str().unwrap(),
            "scan",
        ])
        .unwrap();

        assert_eq!(load_config(&args).unwrap().discovery.port, 1502);
    }
}
