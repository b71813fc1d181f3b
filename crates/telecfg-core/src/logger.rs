#![forbid(unsafe_code)]

//! Diagnostic logger contract consumed by the config engine.
//!
//! The engine never prints on its own account: conversion failures, watcher
//! failures and invalid accesses are routed to an [`InternalLogger`] when one is
//! attached to the handler, and fall back to `tracing` events otherwise.

use std::cell::RefCell;
use std::fmt;

/// Severity of an internal diagnostic message.
///
/// Ordered so that `level >= severity` means "emit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LoggingSeverity {
    /// Nothing is emitted at this level.
    #[default]
    Disabled = 0,
    Critical = 1,
    Warning = 2,
    Debug = 3,
}

impl LoggingSeverity {
    /// Map a numeric config level onto a severity, clamping out-of-range input.
    #[must_use]
    pub fn from_level(level: f64) -> Self {
        match level {
            l if l >= 3.0 => Self::Debug,
            l if l >= 2.0 => Self::Warning,
            l if l >= 1.0 => Self::Critical,
            _ => Self::Disabled,
        }
    }
}

/// Identifier of an internal diagnostic message.
///
/// The throttle manager keys its per-message state on these ids, so arbitrary
/// numeric ids are allowed besides the named constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u32);

impl MessageId {
    pub const MESSAGE_LIMIT_PER_PV_EXCEEDED: Self = Self(58);
    pub const CONFIG_WATCHER_EXCEPTION: Self = Self(107);
    pub const DYNAMIC_CONFIG_EXCEPTION: Self = Self(108);
    pub const DEFAULT_THROTTLE_MSG_KEY: Self = Self(109);
    pub const CONFIG_WATCHER_LOOP: Self = Self(115);

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sink for internal SDK diagnostics.
pub trait InternalLogger {
    /// Report an internal message.
    ///
    /// `is_user_act` marks messages caused directly by a user action; those are
    /// written to the console at most once per message id.
    fn throw_internal(
        &self,
        severity: LoggingSeverity,
        id: MessageId,
        message: &str,
        is_user_act: bool,
    );

    fn warn_to_console(&self, message: &str);

    fn error_to_console(&self, message: &str) {
        self.warn_to_console(message);
    }
}

/// Route a diagnostic to `logger`, or to `tracing` when there is none.
pub(crate) fn report(
    logger: Option<&dyn InternalLogger>,
    severity: LoggingSeverity,
    id: MessageId,
    message: &str,
) {
    match logger {
        Some(logger) => logger.throw_internal(severity, id, message, false),
        None => match severity {
            LoggingSeverity::Critical => tracing::error!(message_id = id.0, "{message}"),
            LoggingSeverity::Warning => tracing::warn!(message_id = id.0, "{message}"),
            _ => tracing::debug!(message_id = id.0, "{message}"),
        },
    }
}

/// One message captured by [`MemoryLogger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedMessage {
    pub severity: LoggingSeverity,
    pub id: MessageId,
    pub message: String,
    pub is_user_act: bool,
}

/// Logger that records every call, for embedders that inspect diagnostics
/// programmatically and for tests.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    messages: RefCell<Vec<LoggedMessage>>,
    console: RefCell<Vec<String>>,
}

impl MemoryLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<LoggedMessage> {
        self.messages.borrow().clone()
    }

    /// Messages recorded with the given id.
    #[must_use]
    pub fn with_id(&self, id: MessageId) -> Vec<LoggedMessage> {
        self.messages
            .borrow()
            .iter()
            .filter(|m| m.id == id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn console(&self) -> Vec<String> {
        self.console.borrow().clone()
    }

    pub fn clear(&self) {
        self.messages.borrow_mut().clear();
        self.console.borrow_mut().clear();
    }
}

impl InternalLogger for MemoryLogger {
    fn throw_internal(
        &self,
        severity: LoggingSeverity,
        id: MessageId,
        message: &str,
        is_user_act: bool,
    ) {
        self.messages.borrow_mut().push(LoggedMessage {
            severity,
            id,
            message: message.to_owned(),
            is_user_act,
        });
    }

    fn warn_to_console(&self, message: &str) {
        self.console.borrow_mut().push(message.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_matches_levels() {
        assert!(LoggingSeverity::Debug > LoggingSeverity::Warning);
        assert!(LoggingSeverity::Warning > LoggingSeverity::Critical);
        assert_eq!(LoggingSeverity::from_level(2.0), LoggingSeverity::Warning);
        assert_eq!(LoggingSeverity::from_level(-4.0), LoggingSeverity::Disabled);
        assert_eq!(LoggingSeverity::from_level(99.0), LoggingSeverity::Debug);
    }

    #[test]
    fn memory_logger_records_and_filters() {
        let logger = MemoryLogger::new();
        report(
            Some(&logger),
            LoggingSeverity::Warning,
            MessageId::DYNAMIC_CONFIG_EXCEPTION,
            "bad",
        );
        logger.warn_to_console("hello");
        logger.error_to_console("boom");

        assert_eq!(logger.messages().len(), 1);
        assert_eq!(logger.with_id(MessageId::DYNAMIC_CONFIG_EXCEPTION).len(), 1);
        assert!(logger.with_id(MessageId::CONFIG_WATCHER_EXCEPTION).is_empty());
        assert_eq!(logger.console(), vec!["hello", "boom"]);

        logger.clear();
        assert!(logger.messages().is_empty());
    }

    #[test]
    fn report_without_logger_does_not_panic() {
        report(None, LoggingSeverity::Critical, MessageId(1), "no sink");
    }
}
