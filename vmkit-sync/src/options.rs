use std::{sync::LazyLock, time::Duration};

use clap::Parser;

/// Environment variable holding extra flags for [`OPTIONS`], e.g.
/// `VMKIT_SYNC_OPTIONS="--spin-limit 0 --fixed-spin 50"`.
pub const OPTIONS_ENV: &str = "VMKIT_SYNC_OPTIONS";

#[derive(Parser, Debug, Clone)]
#[command(name = "vmkit-sync")]
pub struct Options {
    /// Upper bound of the adaptive spin duration of a monitor.
    #[clap(long, default_value_t = 5000)]
    pub spin_limit: i32,

    /// Number of fixed spin iterations tried before adaptive spinning.
    #[clap(long, default_value_t = 10)]
    pub pre_spin: i32,

    #[clap(long, default_value_t = 100)]
    pub spin_bonus: i32,

    #[clap(long, default_value_t = 200)]
    pub spin_penalty: i32,

    /// Floor applied to the spin duration before a bonus is added.
    #[clap(long, default_value_t = 1000)]
    pub spin_poverty: i32,

    /// If positive, adaptive spinning is replaced by a fixed spin of this length.
    #[clap(long, default_value_t = 0)]
    pub fixed_spin: i32,

    /// Minimum time between threshold-driven deflation sweeps, in milliseconds.
    #[clap(long, default_value_t = 250)]
    pub async_deflation_interval: u64,

    /// Sweep idle monitors at least this often (milliseconds, 0 disables).
    #[clap(long, default_value_t = 60000)]
    pub guaranteed_async_deflation_interval: u64,

    /// Percentage of the in-use ceiling that triggers a deflation sweep (0 disables).
    #[clap(long, default_value_t = 90)]
    pub monitor_used_deflation_threshold: u32,

    /// Maximum number of monitors deflated by a single sweep.
    #[clap(long, default_value_t = 1_000_000)]
    pub monitor_deflation_max: usize,

    #[clap(long, default_value_t = 1024)]
    pub avg_monitors_per_thread_estimate: usize,

    /// Sweeps without progress before the in-use ceiling is raised.
    #[clap(long, default_value_t = 3)]
    pub no_async_deflation_progress_max: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self::parse_from(["vmkit-sync"])
    }
}

impl Options {
    /// Parse options from [`OPTIONS_ENV`]. Malformed input is reported and
    /// replaced by the defaults.
    pub fn from_env() -> Self {
        let Ok(raw) = std::env::var(OPTIONS_ENV) else {
            return Self::default();
        };
        let args = std::iter::once("vmkit-sync").chain(raw.split_whitespace());
        match Self::try_parse_from(args) {
            Ok(options) => options,
            Err(err) => {
                log::warn!("ignoring malformed {OPTIONS_ENV}: {err}");
                Self::default()
            }
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            spin: SpinKnobs::from(self),
            deflation: DeflationKnobs::from(self),
        }
    }
}

pub static OPTIONS: LazyLock<Options> = LazyLock::new(Options::from_env);

/// Tuning of the spin controller. All fields are spin iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinKnobs {
    pub limit: i32,
    pub pre_spin: i32,
    pub bonus: i32,
    pub penalty: i32,
    pub poverty: i32,
    pub fixed_spin: i32,
}

impl Default for SpinKnobs {
    fn default() -> Self {
        Self {
            limit: 5000,
            pre_spin: 10,
            bonus: 100,
            penalty: 200,
            poverty: 1000,
            fixed_spin: 0,
        }
    }
}

impl SpinKnobs {
    /// Knobs that never spin. Used on uniprocessors where spinning only
    /// delays the owner.
    pub const fn disabled() -> Self {
        Self {
            limit: 0,
            pre_spin: 0,
            bonus: 0,
            penalty: 0,
            poverty: 0,
            fixed_spin: -1,
        }
    }

    pub fn for_host(self) -> Self {
        match std::thread::available_parallelism() {
            Ok(n) if n.get() == 1 => Self::disabled(),
            _ => self,
        }
    }
}

impl From<&Options> for SpinKnobs {
    fn from(options: &Options) -> Self {
        Self {
            limit: options.spin_limit.max(0),
            pre_spin: options.pre_spin,
            bonus: options.spin_bonus,
            penalty: options.spin_penalty,
            poverty: options.spin_poverty,
            fixed_spin: options.fixed_spin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflationKnobs {
    pub interval: Duration,
    pub guaranteed_interval: Duration,
    pub used_threshold: u32,
    pub max_per_sweep: usize,
    pub avg_monitors_per_thread: usize,
    pub no_progress_max: u32,
}

impl Default for DeflationKnobs {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            guaranteed_interval: Duration::from_millis(60000),
            used_threshold: 90,
            max_per_sweep: 1_000_000,
            avg_monitors_per_thread: 1024,
            no_progress_max: 3,
        }
    }
}

impl From<&Options> for DeflationKnobs {
    fn from(options: &Options) -> Self {
        Self {
            interval: Duration::from_millis(options.async_deflation_interval),
            guaranteed_interval: Duration::from_millis(options.guaranteed_async_deflation_interval),
            used_threshold: options.monitor_used_deflation_threshold,
            max_per_sweep: options.monitor_deflation_max,
            avg_monitors_per_thread: options.avg_monitors_per_thread_estimate,
            no_progress_max: options.no_async_deflation_progress_max,
        }
    }
}

/// Everything a monitor or synchronizer needs to know about its tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorConfig {
    pub spin: SpinKnobs,
    pub deflation: DeflationKnobs,
}

impl MonitorConfig {
    /// Configuration derived from [`OPTIONS`] and the host CPU count.
    pub fn from_options() -> Self {
        let mut config = OPTIONS.monitor_config();
        config.spin = config.spin.for_host();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_knob_defaults() {
        let options = Options::default();
        assert_eq!(SpinKnobs::from(&options), SpinKnobs::default());
        assert_eq!(DeflationKnobs::from(&options), DeflationKnobs::default());
    }

    #[test]
    fn parse_overrides() {
        let options = Options::try_parse_from([
            "vmkit-sync",
            "--spin-limit",
            "64",
            "--fixed-spin",
            "7",
            "--monitor-deflation-max",
            "10",
        ])
        .unwrap();
        let config = options.monitor_config();
        assert_eq!(config.spin.limit, 64);
        assert_eq!(config.spin.fixed_spin, 7);
        assert_eq!(config.deflation.max_per_sweep, 10);
        assert_eq!(config.spin.bonus, 100);
    }

    #[test]
    fn negative_limit_is_clamped() {
        let options = Options::try_parse_from(["vmkit-sync", "--spin-limit=-5"]).unwrap();
        assert_eq!(SpinKnobs::from(&options).limit, 0);
    }
}
