use clap::{Parser, Subcommand};
use tapstorm_utils::Amount;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator service.
    Start(StartArgs),
    /// Query a running coordinator and print its status.
    Status(StatusArgs),
}

#[derive(Parser, Clone, Debug)]
pub struct StartArgs {
    #[arg(long, env = "TAPSTORM_API_PORT", default_value = "3030")]
    pub api_port: u16,

    /// Bind to 0.0.0.0 instead of loopback.
    #[arg(long, env = "TAPSTORM_ALLOW_PUBLIC_BIND")]
    pub allow_public_bind: bool,

    #[arg(long, env = "TAPSTORM_WAITING_PERIOD_SECONDS", default_value = "60")]
    pub waiting_period_secs: u64,

    #[arg(long, env = "TAPSTORM_GAME_DURATION_SECONDS", default_value = "30")]
    pub game_duration_secs: u64,

    #[arg(
        long,
        env = "TAPSTORM_BONUS_GAME_DURATION_SECONDS",
        default_value = "86400"
    )]
    pub bonus_game_duration_secs: u64,

    #[arg(long, env = "TAPSTORM_MAX_TAPS_PER_MESSAGE", default_value = "30")]
    pub max_taps_per_message: u32,

    #[arg(long, env = "TAPSTORM_TAP_WINDOW_MS", default_value = "3000")]
    pub tap_window_ms: u64,

    #[arg(long, env = "TAPSTORM_TAP_WINDOW_MAX", default_value = "60")]
    pub tap_window_max: u64,

    #[arg(long, env = "TAPSTORM_TAP_IDLE_PURGE_MS", default_value = "300000")]
    pub tap_idle_purge_ms: u64,

    #[arg(long, env = "TAPSTORM_TAP_GC_INTERVAL_SECONDS", default_value = "60")]
    pub tap_gc_interval_secs: u64,

    #[arg(long, env = "TAPSTORM_OUTBOUND_QUEUE_SIZE", default_value = "64")]
    pub outbound_queue_size: usize,

    #[arg(long, env = "TAPSTORM_PING_INTERVAL_SECONDS", default_value = "15")]
    pub ping_interval_secs: u64,

    #[arg(long, env = "TAPSTORM_LIVENESS_TIMEOUT_SECONDS", default_value = "45")]
    pub liveness_timeout_secs: u64,

    #[arg(long, env = "TAPSTORM_BONUS_GOAL", default_value = "10000")]
    pub bonus_goal: u64,

    #[arg(long, env = "TAPSTORM_BONUS_REWARD", default_value = "500")]
    pub bonus_reward: Amount,

    #[arg(long, env = "TAPSTORM_BONUS_WINDOW_SECONDS", default_value = "86400")]
    pub bonus_window_secs: u64,
}

#[derive(Parser, Clone, Debug)]
pub struct StatusArgs {
    #[arg(long, env = "TAPSTORM_API_URL", default_value = "http://127.0.0.1:3030")]
    pub api_url: String,
}
