#![forbid(unsafe_code)]

//! telecfg public facade crate.
//!
//! This crate provides the stable surface area for SDK components that read
//! their settings from a live, watchable configuration.

pub use telecfg_core as core;
#[cfg(feature = "throttle")]
pub use telecfg_throttle as throttle;

pub mod prelude {
    pub use telecfg_core::timer::{run_pending_timers, run_timers_until_idle};
    pub use telecfg_core::{
        ConfigDefaults, ConfigError, ConfigHandler, ConfigList, ConfigMap, DefaultCheck,
        DiagnosticLogger, InternalLogger, LoggingSeverity, MessageId, Value, WatchDetails,
        WatchHandle, create_dynamic_config, df, get_dynamic_config_handler, on_config_change,
    };
    #[cfg(feature = "throttle")]
    pub use telecfg_throttle::{ThrottleMgr, ThrottleResult};
}
