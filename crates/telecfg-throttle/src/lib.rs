#![forbid(unsafe_code)]

//! Throttling of internal SDK messages, driven by the live config.
//!
//! [`ThrottleMgr`] reads per-message settings from `throttleMgrCfg` through a
//! [`telecfg_core::ConfigHandler`] watcher and persists per-message counters
//! through a [`ThrottleStorage`].

pub mod config;
pub mod error;
pub mod manager;
pub mod storage;

pub use config::{SAMPLING_SCALE, ThrottleConfig, ThrottleInterval, ThrottleLimit};
pub use error::{Result, ThrottleError};
pub use manager::{
    Clock, OsRandom, RandomSource, SystemClock, ThrottleMgr, ThrottleMgrBuilder, ThrottleResult,
    check_interval,
};
pub use storage::{
    MemoryStorage, THROTTLE_STORAGE_PREFIX, ThrottleState, ThrottleStorage, start_of_day,
    storage_key,
};
