#![forbid(unsafe_code)]

//! The SDK's own diagnostic logger, configured through a dynamic config.
//!
//! [`DiagnosticLogger`] reads `loggingLevelConsole`, `loggingLevelTelemetry`
//! and `maxMessageLimit` inside a config watcher, so changing any of them on
//! the live config takes effect on the next notification. Console output is
//! emitted as `tracing` events; internal messages destined for telemetry are
//! kept in [`DiagnosticLogger::queue`].
//!
//! # Invariants
//!
//! 1. Each message id is queued at most once until
//!    [`reset_internal_message_count`](DiagnosticLogger::reset_internal_message_count).
//! 2. Once `maxMessageLimit` messages are queued, exactly one "limit reached"
//!    message follows and nothing else is queued.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use crate::defaults::ConfigDefaults;
use crate::handler::ConfigHandler;
use crate::logger::{InternalLogger, LoggedMessage, LoggingSeverity, MessageId};
use crate::scheduler::WatchHandle;
use crate::value::Value;

const THROTTLE_LIMIT_MESSAGE: &str = "Internal events throttle limit per PageView reached for this app.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoggerSettings {
    console: LoggingSeverity,
    telemetry: LoggingSeverity,
    max_messages: usize,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            console: LoggingSeverity::Disabled,
            telemetry: LoggingSeverity::Critical,
            max_messages: 25,
        }
    }
}

/// Defaults for the logger's settings.
#[must_use]
pub fn logger_defaults() -> ConfigDefaults {
    ConfigDefaults::new()
        .with("loggingLevelConsole", 0)
        .with("loggingLevelTelemetry", 1)
        .with("maxMessageLimit", 25)
}

/// Which "already logged" set a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LoggedKey {
    Console(MessageId),
    Queued(MessageId),
}

#[derive(Default)]
pub struct DiagnosticLogger {
    settings: Cell<LoggerSettings>,
    message_count: Cell<usize>,
    logged: RefCell<HashSet<LoggedKey>>,
    queue: RefCell<Vec<LoggedMessage>>,
    handler: RefCell<Option<ConfigHandler>>,
    watcher: RefCell<Option<WatchHandle>>,
}

impl DiagnosticLogger {
    /// Create a logger whose settings live in `config`.
    ///
    /// The config is made dynamic (with this logger attached to its
    /// handler) if it is not already. The logger keeps the config alive, so a
    /// temporary config still drives it; the handler's core holds the logger
    /// in turn, and the pair is only released by [`unload`](Self::unload).
    pub fn new(config: impl Into<Value>) -> Rc<Self> {
        let logger = Rc::new(Self::default());
        let handler = ConfigHandler::builder(config)
            .defaults(logger_defaults())
            .logger(logger.clone())
            .build();

        let weak: Weak<Self> = Rc::downgrade(&logger);
        let handle = handler.watch(move |details| {
            if let Some(logger) = weak.upgrade() {
                let cfg = details.cfg();
                let level = |name: &str, fallback: f64| cfg.get(name).as_f64().unwrap_or(fallback);
                logger.settings.set(LoggerSettings {
                    console: LoggingSeverity::from_level(level("loggingLevelConsole", 0.0)),
                    telemetry: LoggingSeverity::from_level(level("loggingLevelTelemetry", 1.0)),
                    max_messages: level("maxMessageLimit", 25.0).max(0.0) as usize,
                });
            }
            Ok(())
        });
        *logger.watcher.borrow_mut() = Some(handle);
        *logger.handler.borrow_mut() = Some(handler);
        logger
    }

    /// The live config the settings are read from, until unloaded.
    #[must_use]
    pub fn config(&self) -> Option<Value> {
        self.handler.borrow().as_ref().map(|handler| handler.cfg().clone())
    }

    /// Messages queued for telemetry.
    #[must_use]
    pub fn queue(&self) -> Vec<LoggedMessage> {
        self.queue.borrow().clone()
    }

    /// Hand the queued messages to the caller, leaving the queue empty.
    pub fn take_queue(&self) -> Vec<LoggedMessage> {
        std::mem::take(&mut *self.queue.borrow_mut())
    }

    #[must_use]
    pub fn console_logging_level(&self) -> LoggingSeverity {
        self.settings.get().console
    }

    #[must_use]
    pub fn telemetry_logging_level(&self) -> LoggingSeverity {
        self.settings.get().telemetry
    }

    #[must_use]
    pub fn max_message_limit(&self) -> usize {
        self.settings.get().max_messages
    }

    /// Start a new session: counts and "already logged" ids are forgotten.
    pub fn reset_internal_message_count(&self) {
        self.message_count.set(0);
        self.logged.borrow_mut().clear();
    }

    /// Stop following config changes and release the config.
    pub fn unload(&self) {
        if let Some(handle) = self.watcher.borrow_mut().take() {
            handle.rm();
        }
        let handler = self.handler.borrow_mut().take();
        drop(handler);
    }

    fn throttled(&self) -> bool {
        self.message_count.get() >= self.settings.get().max_messages
    }

    fn first_time(&self, key: LoggedKey) -> bool {
        self.logged.borrow_mut().insert(key)
    }

    fn console(&self, severity: LoggingSeverity, message: &str) {
        if severity == LoggingSeverity::Critical {
            self.error_to_console(message);
        } else {
            self.warn_to_console(message);
        }
    }

    fn log_internal_message(&self, severity: LoggingSeverity, message: LoggedMessage) {
        if self.throttled() || !self.first_time(LoggedKey::Queued(message.id)) {
            return;
        }

        let settings = self.settings.get();
        if severity <= settings.telemetry {
            self.queue.borrow_mut().push(message);
            self.message_count.set(self.message_count.get() + 1);
        }

        if self.message_count.get() == settings.max_messages {
            self.queue.borrow_mut().push(LoggedMessage {
                severity,
                id: MessageId::MESSAGE_LIMIT_PER_PV_EXCEEDED,
                message: THROTTLE_LIMIT_MESSAGE.to_owned(),
                is_user_act: false,
            });
            self.console(severity, THROTTLE_LIMIT_MESSAGE);
        }
    }
}

impl InternalLogger for DiagnosticLogger {
    fn throw_internal(
        &self,
        severity: LoggingSeverity,
        id: MessageId,
        message: &str,
        is_user_act: bool,
    ) {
        let text = format!("Internal: {id} message:{message:?}");
        let console_level = self.settings.get().console;
        if is_user_act {
            if console_level >= severity && self.first_time(LoggedKey::Console(id)) {
                self.console(severity, &text);
            }
        } else if console_level >= severity {
            self.console(severity, &text);
        }

        self.log_internal_message(
            severity,
            LoggedMessage {
                severity,
                id,
                message: text,
                is_user_act,
            },
        );
    }

    fn warn_to_console(&self, message: &str) {
        tracing::warn!(target: "telecfg::console", "{message}");
    }

    fn error_to_console(&self, message: &str) {
        tracing::error!(target: "telecfg::console", "{message}");
    }
}
