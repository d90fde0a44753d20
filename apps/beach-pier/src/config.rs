use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Beach signaling relay for WebRTC peers"
)]
pub struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(
        long,
        global = true,
        env = "BEACH_PIER_LOG_LEVEL",
        default_value = "info"
    )]
    pub log_level: String,

    /// Log line format.
    #[arg(
        long,
        global = true,
        env = "BEACH_PIER_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text
    )]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub serve: ServeArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print a signed relay token for a user instead of serving.
    IssueToken(IssueTokenArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN", default_value = "0.0.0.0:8778")]
    pub listen: String,

    /// Instance label attached to metrics and logs. Random when unset.
    #[arg(long, env = "BEACH_PIER_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Shared secret used to sign and verify relay tokens.
    #[arg(long, env = "BEACH_PIER_TOKEN_SECRET", hide_env_values = true)]
    pub token_secret: Option<String>,

    /// Accept connect requests without authentication (development only).
    #[arg(long, env = "BEACH_PIER_INSECURE", default_value_t = false)]
    pub insecure: bool,

    /// Expose the MCU websocket endpoints.
    #[arg(long, env = "BEACH_PIER_ENABLE_MCU_API", default_value_t = false)]
    pub enable_mcu_api: bool,

    /// Regular expression; channel ids it matches anywhere are routed through an MCU pipeline.
    #[arg(long, env = "BEACH_PIER_PIPELINE_FORCED_PATTERN")]
    pub pipeline_forced_pattern: Option<String>,

    /// Upper bound for draining connections after the first shutdown signal.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8778".to_string(),
            instance_id: None,
            token_secret: None,
            insecure: false,
            enable_mcu_api: false,
            pipeline_forced_pattern: None,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct IssueTokenArgs {
    /// Subject (user id) the token is issued for.
    #[arg(long)]
    pub subject: String,

    /// Display name carried in the token.
    #[arg(long)]
    pub name: Option<String>,

    /// Token lifetime in seconds.
    #[arg(long, default_value_t = 3600)]
    pub ttl_secs: u64,

    /// Secret the token is signed with.
    #[arg(
        long = "secret",
        env = "BEACH_PIER_TOKEN_SECRET",
        hide_env_values = true
    )]
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub instance_id: String,
    pub token_secret: Option<String>,
    pub insecure: bool,
    pub enable_mcu_api: bool,
    pub shutdown_grace: Duration,
    pub connection: ConnectionSettings,
    pub rtm: RtmSettings,
    pub pipeline: PipelineSettings,
    pub mcu: McuSettings,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen))?;
        let token_secret = args.token_secret.filter(|secret| !secret.is_empty());
        if token_secret.is_none() && !args.insecure {
            bail!("a token secret is required unless --insecure is set");
        }
        let rtm = RtmSettings {
            pipeline_forced_pattern: args.pipeline_forced_pattern,
            ..RtmSettings::default()
        };
        Ok(ServerConfig {
            listen_addr,
            instance_id: args
                .instance_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            token_secret,
            insecure: args.insecure,
            enable_mcu_api: args.enable_mcu_api,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            connection: ConnectionSettings::default(),
            rtm,
            pipeline: PipelineSettings::default(),
            mcu: McuSettings::default(),
        })
    }
}

/// Limits and timers applied to every websocket connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_message_size: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub queue_capacity: usize,
}

impl ConnectionSettings {
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait * 9 / 10;
        self
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RtmSettings {
    pub key_expiration: Duration,
    pub sweep_interval: Duration,
    pub channel_expiration: Duration,
    pub user_idle: Duration,
    pub key_bytes: usize,
    pub channel_id_bytes: usize,
    pub pipeline_forced_pattern: Option<String>,
}

impl Default for RtmSettings {
    fn default() -> Self {
        Self {
            key_expiration: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            channel_expiration: Duration::from_secs(60),
            user_idle: Duration::from_secs(60),
            key_bytes: 24,
            channel_id_bytes: 24,
            pipeline_forced_pattern: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub watchdog: Duration,
    pub reconnect_delay: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct McuSettings {
    pub attach_expiration: Duration,
    pub sweep_interval: Duration,
}

impl Default for McuSettings {
    fn default() -> Self {
        Self {
            attach_expiration: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
