use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

/// Instance role, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl FromStr for Role {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, ()> {
        match value.to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            _ => Err(()),
        }
    }
}

/// Logging verbosity, including the `quiet` level that disables the logger
/// outright rather than merely raising its threshold.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogLevel {
    Quiet,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.to_ascii_lowercase().as_str() {
            "quiet" => Self::Quiet,
            "error" => Self::Error,
            "warn" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            other => return Err(format!("unknown log level: {other}")),
        })
    }
}

impl LogLevel {
    /// `None` means "do not install a logger at all".
    pub fn as_level(&self) -> Option<log::Level> {
        Some(match self {
            Self::Quiet => return None,
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        })
    }
}

/// Runtime tuning knobs, sourced only from the optional config file — there
/// is no command-line equivalent for any of these, matching the external
/// interface table.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub receive_buffer_size: usize,
    pub packet_queue_size: usize,
    pub client_connection_timeout: Duration,
    pub server_connection_timeout: Duration,
    pub server_peer_connection_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            receive_buffer_size: 2048,
            packet_queue_size: 256,
            client_connection_timeout: Duration::from_secs(20),
            server_connection_timeout: Duration::from_secs(20),
            server_peer_connection_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(2),
        }
    }
}

impl Tuning {
    fn from_ini(ini: &ini::Ini) -> Self {
        let defaults = Self::default();

        let connection = ini.section(Some("CONNECTION"));
        let keep_alive = ini.section(Some("KEEP-ALIVE"));

        let get_usize = |section: Option<&ini::Properties>, key: &str, default: usize| {
            section
                .and_then(|s| s.get(key))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default)
        };

        let get_secs = |section: Option<&ini::Properties>, key: &str, default: Duration| {
            section
                .and_then(|s| s.get(key))
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            receive_buffer_size: get_usize(
                connection,
                "receive_buffer_size",
                defaults.receive_buffer_size,
            ),
            packet_queue_size: get_usize(
                connection,
                "packet_queue_size",
                defaults.packet_queue_size,
            ),
            client_connection_timeout: get_secs(
                connection,
                "client_connection_timeout",
                defaults.client_connection_timeout,
            ),
            server_connection_timeout: get_secs(
                connection,
                "server_connection_timeout",
                defaults.server_connection_timeout,
            ),
            server_peer_connection_timeout: get_secs(
                connection,
                "server_peer_connection_timeout",
                defaults.server_peer_connection_timeout,
            ),
            ping_interval: get_secs(keep_alive, "ping_interval", defaults.ping_interval),
            ping_timeout: get_secs(keep_alive, "ping_timeout", defaults.ping_timeout),
        }
    }
}

/// Every validation failure that can occur before any socket work begins.
/// Each variant maps to exactly one exit code, mirroring the reference
/// implementation's `SystemExit(N)` ladder so operators scripting around
/// this tool see stable codes across a port.
#[derive(Debug)]
pub enum StartupError {
    MissingRole,
    ServerMissingListenPort,
    ClientMissingSourceIp,
    ClientMissingDestinationIp,
    ClientMissingDestinationPort,
    InterfaceResolutionFailed(String),
    NoBindAddress,
    InvalidPeerCount,
    InvalidSourceIp,
    InvalidDestinationIp,
    InvalidServerRelayBasePort,
    InvalidClientRelayBasePort,
    InvalidListenPort,
    InvalidDestinationPort,
    AdmissionSocketBindFailed(std::io::Error),
    SourceSocketBindFailed(usize, std::io::Error),
    DestinationSocketBindFailed(usize, std::io::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingRole => 1,
            Self::ServerMissingListenPort => 2,
            Self::ClientMissingSourceIp => 3,
            Self::ClientMissingDestinationIp => 4,
            Self::ClientMissingDestinationPort => 5,
            Self::InterfaceResolutionFailed(_) => 6,
            Self::NoBindAddress => 7,
            Self::InvalidPeerCount => 8,
            Self::InvalidSourceIp => 9,
            Self::InvalidDestinationIp => 10,
            Self::InvalidServerRelayBasePort => 11,
            Self::InvalidClientRelayBasePort => 12,
            Self::InvalidListenPort => 13,
            Self::InvalidDestinationPort => 14,
            Self::AdmissionSocketBindFailed(_) => 15,
            Self::SourceSocketBindFailed(_, _) => 16,
            Self::DestinationSocketBindFailed(_, _) => 17,
        }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRole => write!(f, "-m must be one of 'server' or 'client'"),
            Self::ServerMissingListenPort => write!(f, "server mode requires -i"),
            Self::ClientMissingSourceIp => write!(f, "client mode requires -s"),
            Self::ClientMissingDestinationIp => write!(f, "client mode requires -d"),
            Self::ClientMissingDestinationPort => write!(f, "client mode requires -o"),
            Self::InterfaceResolutionFailed(ifname) => {
                write!(f, "could not resolve an IPv4 address for interface {ifname}")
            }
            Self::NoBindAddress => {
                write!(f, "one of -e or -l is required, and -l must be a valid IPv4 address")
            }
            Self::InvalidPeerCount => write!(f, "-p must be at least 1"),
            Self::InvalidSourceIp => write!(f, "-s is not a valid IPv4 address"),
            Self::InvalidDestinationIp => write!(f, "-d is not a valid IPv4 address"),
            Self::InvalidServerRelayBasePort => {
                write!(f, "--server-relay-base-port must be in [1024, 65535]")
            }
            Self::InvalidClientRelayBasePort => {
                write!(f, "--client-relay-base-port must be in [1024, 65535]")
            }
            Self::InvalidListenPort => write!(f, "-i must be in [1024, 65535]"),
            Self::InvalidDestinationPort => write!(f, "-o must be in [1024, 65535]"),
            Self::AdmissionSocketBindFailed(err) => write!(f, "failed to bind admission socket: {err}"),
            Self::SourceSocketBindFailed(index, err) => {
                write!(f, "slot {index}: failed to bind source socket: {err}")
            }
            Self::DestinationSocketBindFailed(index, err) => {
                write!(f, "slot {index}: failed to bind destination socket: {err}")
            }
        }
    }
}

impl std::error::Error for StartupError {}

const PORT_RANGE: std::ops::RangeInclusive<u16> = 1024..=65535;

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Instance role: server or client.
    #[arg(short = 'm', long = "mode")]
    pub mode: Option<String>,

    /// Bind interface name (Linux `SO_BINDTODEVICE`-style); mutually
    /// exclusive with `-l`.
    #[arg(short = 'e', long = "interface")]
    pub interface: Option<String>,

    /// Bind interface IPv4 address; mutually exclusive with `-e`.
    #[arg(short = 'l', long = "local-ip")]
    pub local_ip: Option<String>,

    /// Number of peer slots.
    #[arg(short = 'p', long = "peers", default_value_t = 1)]
    pub peers: u32,

    /// Server's public listening port (server only, required).
    #[arg(short = 'i', long = "interface-port")]
    pub listen_port: Option<u16>,

    /// Server's public IP (client only, required).
    #[arg(short = 's', long = "source-ip")]
    pub source_ip: Option<String>,

    /// Private endpoint IP (client only, required).
    #[arg(short = 'd', long = "destination-ip")]
    pub destination_ip: Option<String>,

    /// Private endpoint port (client only, required).
    #[arg(short = 'o', long = "destination-port")]
    pub destination_port: Option<u16>,

    #[arg(long = "server-relay-base-port", default_value_t = 23000)]
    pub server_relay_base_port: u16,

    #[arg(long = "client-relay-base-port", default_value_t = 23100)]
    pub client_relay_base_port: u16,

    /// Suppress all logging.
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Optional path to the section-keyed runtime config file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<String>,
}

/// Fully validated, immutable configuration shared via `Arc` once built.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub role: Role,
    pub bind_ip: Ipv4Addr,
    pub peers: u32,
    pub listen_port: u16,
    pub source_ip: Ipv4Addr,
    pub destination_ip: Ipv4Addr,
    pub destination_port: u16,
    pub server_relay_base_port: u16,
    pub client_relay_base_port: u16,
    pub log_level: LogLevel,
    pub tuning: std::sync::Arc<Tuning>,
}

impl RuntimeConfig {
    pub fn load() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        let role = match cli.mode.as_deref().map(str::parse::<Role>) {
            Some(Ok(role)) => role,
            _ => return Err(StartupError::MissingRole.into()),
        };

        let log_level = resolve_log_level(cli.config.as_deref(), cli.quiet);

        let tuning = match &cli.config {
            Some(path) => match ini::Ini::load_from_file(path) {
                Ok(ini) => Tuning::from_ini(&ini),
                Err(err) => {
                    log::warn!("could not read config file {path} ({err}), using defaults");
                    Tuning::default()
                }
            },
            None => Tuning::default(),
        };

        let bind_ip = resolve_bind_ip(cli.interface.as_deref(), cli.local_ip.as_deref())?;

        if cli.peers < 1 {
            return Err(StartupError::InvalidPeerCount.into());
        }

        let (listen_port, source_ip, destination_ip, destination_port) = match role {
            Role::Server => {
                let listen_port = cli
                    .listen_port
                    .ok_or(StartupError::ServerMissingListenPort)?;
                if !PORT_RANGE.contains(&listen_port) {
                    return Err(StartupError::InvalidListenPort.into());
                }
                (listen_port, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, 0)
            }
            Role::Client => {
                let source_ip = cli
                    .source_ip
                    .as_deref()
                    .ok_or(StartupError::ClientMissingSourceIp)?
                    .parse::<Ipv4Addr>()
                    .map_err(|_| StartupError::InvalidSourceIp)?;
                let destination_ip = cli
                    .destination_ip
                    .as_deref()
                    .ok_or(StartupError::ClientMissingDestinationIp)?
                    .parse::<Ipv4Addr>()
                    .map_err(|_| StartupError::InvalidDestinationIp)?;
                let destination_port = cli
                    .destination_port
                    .ok_or(StartupError::ClientMissingDestinationPort)?;
                if !PORT_RANGE.contains(&destination_port) {
                    return Err(StartupError::InvalidDestinationPort.into());
                }
                (0, source_ip, destination_ip, destination_port)
            }
        };

        if !PORT_RANGE.contains(&cli.server_relay_base_port) {
            return Err(StartupError::InvalidServerRelayBasePort.into());
        }
        if !PORT_RANGE.contains(&cli.client_relay_base_port) {
            return Err(StartupError::InvalidClientRelayBasePort.into());
        }

        Ok(Self {
            role,
            bind_ip,
            peers: cli.peers,
            listen_port,
            source_ip,
            destination_ip,
            destination_port,
            server_relay_base_port: cli.server_relay_base_port,
            client_relay_base_port: cli.client_relay_base_port,
            log_level,
            tuning: std::sync::Arc::new(tuning),
        })
    }
}

fn resolve_log_level(config_path: Option<&str>, quiet: bool) -> LogLevel {
    if quiet {
        return LogLevel::Quiet;
    }

    config_path
        .and_then(|path| ini::Ini::load_from_file(path).ok())
        .and_then(|ini| {
            ini.section(Some("LOGGING"))
                .and_then(|s| s.get("logging_level"))
                .and_then(|v| v.parse::<LogLevel>().ok())
        })
        .unwrap_or_default()
}

/// Resolves the local bind address from `-e`/`-l`. `-e` is preferred when
/// both happen to be supplied would be ambiguous, so the two are treated as
/// mutually exclusive; exactly one must resolve to an address.
fn resolve_bind_ip(interface: Option<&str>, local_ip: Option<&str>) -> Result<Ipv4Addr, StartupError> {
    match (interface, local_ip) {
        (Some(ifname), _) => resolve_interface_ip(ifname)
            .ok_or_else(|| StartupError::InterfaceResolutionFailed(ifname.to_string())),
        (None, Some(ip)) => ip.parse::<Ipv4Addr>().map_err(|_| StartupError::NoBindAddress),
        (None, None) => Err(StartupError::NoBindAddress),
    }
}

/// Looks up the first IPv4 address bound to the named interface, the
/// portable analogue of `SO_BINDTODEVICE` for platforms (and callers) that
/// only need the address, not a literal device-bound socket.
fn resolve_interface_ip(ifname: &str) -> Option<Ipv4Addr> {
    if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .find(|iface| iface.name == ifname)
        .and_then(|iface| match iface.addr.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        })
}
