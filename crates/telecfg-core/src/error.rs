#![forbid(unsafe_code)]

//! Error taxonomy for the dynamic configuration engine.
//!
//! Only two kinds ever reach a caller: [`ConfigError::ReadOnly`] from a write to
//! a read-only property, and [`ConfigError::InvalidAccess`] from
//! [`on_config_change`](crate::on_config_change) when no logger is available to
//! absorb it. Everything else is reported through the diagnostic logger and the
//! affected value degrades to a plain, non-reactive field.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A read-only property was assigned a different value.
    #[error("[{name}] is read-only:{dump}")]
    ReadOnly { name: String, dump: String },

    /// A value could not be converted into (or assigned as) a dynamic property.
    #[error("Unable to dynamically {desc} [{name}]: {reason}")]
    Conversion {
        name: String,
        desc: String,
        reason: String,
    },

    /// The container was frozen and rejects new or changed slots.
    #[error("container is frozen")]
    Frozen,

    /// The target of a property operation is not a map or a list.
    #[error("target is not a config container")]
    NotAContainer,

    /// A config object was used as if it were dynamic but has no handler.
    #[error("invalid access: {0}")]
    InvalidAccess(String),

    /// A watcher callback reported a failure.
    #[error("{0}")]
    Callback(String),
}

impl ConfigError {
    #[must_use]
    pub fn conversion(
        name: impl Into<String>,
        desc: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Conversion {
            name: name.into(),
            desc: desc.into(),
            reason: reason.to_string(),
        }
    }

    /// Convenience for watcher bodies that fail for their own reasons.
    #[must_use]
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback(message.into())
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_message_names_property() {
        let err = ConfigError::ReadOnly {
            name: "endpointUrl".into(),
            dump: "{}".into(),
        };
        assert_eq!(err.to_string(), "[endpointUrl] is read-only:{}");
        assert!(err.is_read_only());
    }

    #[test]
    fn conversion_message_includes_reason() {
        let err = ConfigError::conversion("cookieCfg", "Converting", ConfigError::Frozen);
        assert_eq!(
            err.to_string(),
            "Unable to dynamically Converting [cookieCfg]: container is frozen"
        );
        assert!(!err.is_read_only());
    }
}
