#![forbid(unsafe_code)]

//! Persisted per-message throttle state.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use telecfg_core::MessageId;

use crate::error::{Result, ThrottleError};

/// Prefix shared by every persisted throttle key.
pub const THROTTLE_STORAGE_PREFIX: &str = "telemetryThrottle";

/// Storage key for one message id: `telemetryThrottle<prefix>-<id>`.
#[must_use]
pub fn storage_key(prefix: &str, id: MessageId) -> String {
    format!("{THROTTLE_STORAGE_PREFIX}{prefix}-{id}")
}

/// Truncate to midnight UTC; all persisted dates are whole days.
#[must_use]
pub fn start_of_day(date: DateTime<Utc>) -> DateTime<Utc> {
    date.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Key/value store the throttle manager persists into.
pub trait ThrottleStorage {
    /// Whether the store can be used at all. A manager with unavailable
    /// storage never throttles.
    fn is_available(&self) -> bool {
        true
    }

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// In-memory storage, also used by tests to inspect persisted state.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: RefCell<HashMap<String, String>>,
    available: Cell<bool>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
            available: Cell::new(true),
        }
    }
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability. While unavailable every access fails.
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl ThrottleStorage for MemoryStorage {
    fn is_available(&self) -> bool {
        self.available.get()
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        if !self.available.get() {
            return Err(ThrottleError::Storage(format!("cannot read [{key}]")));
        }
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if !self.available.get() {
            return Err(ThrottleError::Storage(format!("cannot write [{key}]")));
        }
        self.entries
            .borrow_mut()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Counter persisted for one message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleState {
    /// Day the interval checks are measured from.
    pub date: DateTime<Utc>,
    /// Messages seen since the last trigger.
    pub count: u32,
    /// Day the last trigger fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_trigger_date: Option<DateTime<Utc>>,
}

impl ThrottleState {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            date: start_of_day(now),
            count: 0,
            pre_trigger_date: None,
        }
    }

    pub(crate) fn load(storage: &dyn ThrottleStorage, key: &str) -> Result<Option<Self>> {
        match storage.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn store(&self, storage: &dyn ThrottleStorage, key: &str) -> Result<()> {
        let raw = serde_json::to_string(self)?;
        storage.set(key, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_includes_prefix_and_id() {
        assert_eq!(storage_key("", MessageId(109)), "telemetryThrottle-109");
        assert_eq!(storage_key("app1", MessageId(7)), "telemetryThrottleapp1-7");
    }

    #[test]
    fn dates_truncate_to_midnight() {
        let noon = Utc.with_ymd_and_hms(2024, 5, 17, 12, 34, 56).unwrap();
        let state = ThrottleState::new(noon);
        assert_eq!(state.date, Utc.with_ymd_and_hms(2024, 5, 17, 0, 0, 0).unwrap());
    }

    #[test]
    fn state_persists_as_camel_case_json() {
        let storage = MemoryStorage::new();
        let day = Utc.with_ymd_and_hms(2024, 1, 28, 0, 0, 0).unwrap();
        let state = ThrottleState {
            date: day,
            count: 3,
            pre_trigger_date: Some(day),
        };
        state.store(&storage, "k").unwrap();

        let raw: serde_json::Value = serde_json::from_str(&storage.raw("k").unwrap()).unwrap();
        assert_eq!(raw["count"], 3);
        assert!(raw.get("preTriggerDate").is_some());
        assert_eq!(ThrottleState::load(&storage, "k").unwrap(), Some(state));
    }

    #[test]
    fn missing_pre_trigger_date_is_omitted() {
        let state = ThrottleState::new(Utc::now());
        let raw = serde_json::to_value(&state).unwrap();
        assert!(raw.get("preTriggerDate").is_none());
    }

    #[test]
    fn unavailable_storage_fails_and_corrupt_state_is_an_error() {
        let storage = MemoryStorage::new();
        storage.set("bad", "{not json").unwrap();
        assert!(matches!(
            ThrottleState::load(&storage, "bad"),
            Err(ThrottleError::Serialization(_))
        ));

        storage.set_available(false);
        assert!(!storage.is_available());
        assert!(matches!(storage.get("bad"), Err(ThrottleError::Storage(_))));
    }
}
