#![forbid(unsafe_code)]

//! Core: reactive dynamic configuration for the telemetry SDK.
//!
//! A plain config tree is converted in place into tracked properties. Watchers
//! registered on the handler record what they read and re-run, batched on the
//! next task-queue turn, whenever any of it changes. Defaults are declared as
//! schemas and applied through the same tracked setters.
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use telecfg_core::{create_dynamic_config, Value};
//!
//! let handler = create_dynamic_config(Value::from(serde_json::json!({"level": 1})), None);
//! let seen = Rc::new(Cell::new(0.0));
//! let sink = Rc::clone(&seen);
//! let _watch = handler.watch(move |details| {
//!     sink.set(details.cfg().get("level").as_f64().unwrap_or(0.0));
//!     Ok(())
//! });
//!
//! handler.cfg().set("level", 3).unwrap();
//! telecfg_core::timer::run_pending_timers();
//! assert_eq!(seen.get(), 3.0);
//! ```

pub mod defaults;
pub mod diagnostics;
pub mod error;
pub mod handler;
pub mod logger;
mod materialize;
mod property;
pub mod scheduler;
pub mod timer;
pub mod value;

pub use defaults::{ConfigDefaults, DefaultCheck, DefaultValue, df};
pub use diagnostics::DiagnosticLogger;
pub use error::{ConfigError, Result};
pub use handler::{
    ConfigHandler, ConfigHandlerBuilder, WatchDetails, create_dynamic_config,
    get_dynamic_config_handler, on_config_change,
};
pub use logger::{InternalLogger, LoggedMessage, LoggingSeverity, MemoryLogger, MessageId};
pub use materialize::{block_dynamic_conversion, force_dynamic_conversion};
pub use scheduler::{MAX_NOTIFY_PASSES, WatchGuard, WatchHandle, WatcherFn};
pub use value::{
    AsContainer, ConfigFn, ConfigList, ConfigMap, ContainerRef, Key, Opaque, Value, deep_copy,
};
