use tapstorm_utils::Amount;

use crate::cli::StartArgs;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub general: GeneralConfig,
    pub timing: RoomTimingConfig,
    pub limits: TapLimitsConfig,
    pub bonus: BonusConfig,
}

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub api_port: u16,
    pub allow_public_bind: bool,
    /// Capacity of each connection's outbound queue; overflow drops the
    /// connection rather than backpressuring the room.
    pub outbound_queue_size: usize,
    pub ping_interval_secs: u64,
    /// Connections silent for longer than this are forcibly closed.
    pub liveness_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RoomTimingConfig {
    pub waiting_period_secs: u64,
    pub game_duration_secs: u64,
    /// Bonus challenges run as one long fixed-duration game.
    pub bonus_game_duration_secs: u64,
}

#[derive(Debug, Clone)]
pub struct TapLimitsConfig {
    /// Per-message ceiling on the batched tap count.
    pub max_taps_per_message: u32,
    /// Trailing window length for the rate check.
    pub window_ms: u64,
    /// Maximum taps allowed inside one trailing window.
    pub window_max_taps: u64,
    /// Windows idle for longer than this are garbage collected.
    pub idle_purge_ms: u64,
    pub gc_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct BonusConfig {
    pub goal: u64,
    pub reward: Amount,
    pub window_secs: u64,
}

impl ServiceConfig {
    pub fn from_start_args(args: &StartArgs) -> Self {
        Self {
            general: GeneralConfig {
                api_port: args.api_port,
                allow_public_bind: args.allow_public_bind,
                outbound_queue_size: args.outbound_queue_size,
                ping_interval_secs: args.ping_interval_secs,
                liveness_timeout_secs: args.liveness_timeout_secs,
            },
            timing: RoomTimingConfig {
                waiting_period_secs: args.waiting_period_secs,
                game_duration_secs: args.game_duration_secs,
                bonus_game_duration_secs: args.bonus_game_duration_secs,
            },
            limits: TapLimitsConfig {
                max_taps_per_message: args.max_taps_per_message,
                window_ms: args.tap_window_ms,
                window_max_taps: args.tap_window_max,
                idle_purge_ms: args.tap_idle_purge_ms,
                gc_interval_secs: args.tap_gc_interval_secs,
            },
            bonus: BonusConfig {
                goal: args.bonus_goal,
                reward: args.bonus_reward,
                window_secs: args.bonus_window_secs,
            },
        }
    }

    /// Short timers and tight limits for tests.
    pub fn test() -> Self {
        Self {
            general: GeneralConfig {
                api_port: 0,
                allow_public_bind: false,
                outbound_queue_size: 16,
                ping_interval_secs: 1,
                liveness_timeout_secs: 3,
            },
            timing: RoomTimingConfig {
                waiting_period_secs: 1,
                game_duration_secs: 1,
                bonus_game_duration_secs: 3600,
            },
            limits: TapLimitsConfig {
                max_taps_per_message: 30,
                window_ms: 3_000,
                window_max_taps: 60,
                idle_purge_ms: 60_000,
                gc_interval_secs: 30,
            },
            bonus: BonusConfig {
                goal: 100,
                reward: 50,
                window_secs: 3600,
            },
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                api_port: 3030,
                allow_public_bind: false,
                outbound_queue_size: 64,
                ping_interval_secs: 15,
                liveness_timeout_secs: 45,
            },
            timing: RoomTimingConfig {
                waiting_period_secs: 60,
                game_duration_secs: 30,
                bonus_game_duration_secs: 86_400,
            },
            limits: TapLimitsConfig {
                max_taps_per_message: 30,
                window_ms: 3_000,
                window_max_taps: 60,
                idle_purge_ms: 300_000,
                gc_interval_secs: 60,
            },
            bonus: BonusConfig {
                goal: 10_000,
                reward: 500,
                window_secs: 86_400,
            },
        }
    }
}
