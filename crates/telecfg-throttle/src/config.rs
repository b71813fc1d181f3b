#![forbid(unsafe_code)]

//! Per-message throttle settings read from the live config.
//!
//! Settings live under `throttleMgrCfg.<messageId>`:
//!
//! ```text
//! { disabled, limit: { samplingRate, maxSendNumber },
//!   interval: { monthInterval, dayInterval, daysOfMonth } }
//! ```
//!
//! Missing or zero limits fall back to a sampling rate of 100 (per million)
//! and one message per trigger. Without any interval the message may fire on
//! the 28th of every third month.

use serde::Serialize;
use telecfg_core::Value;

/// Sampling denominator: `samplingRate` is out of this many.
pub const SAMPLING_SCALE: u32 = 1_000_000;

const DEFAULT_SAMPLING_RATE: u32 = 100;
const DEFAULT_MAX_SEND_NUMBER: u32 = 1;
const DEFAULT_MONTH_INTERVAL: u32 = 3;
const DEFAULT_DAY_OF_MONTH: u32 = 28;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleLimit {
    pub sampling_rate: u32,
    pub max_send_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleInterval {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_interval: Option<u32>,
    /// When non-empty, the message may only fire on these days of the month.
    pub days_of_month: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleConfig {
    pub disabled: bool,
    pub limit: ThrottleLimit,
    pub interval: ThrottleInterval,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::from_value(&Value::Undefined)
    }
}

/// Positive integer at `name`, `None` for anything else.
fn positive(cfg: &Value, name: &str) -> Option<u32> {
    cfg.get(name)
        .as_f64()
        .filter(|n| *n >= 1.0)
        .map(|n| n.min(f64::from(u32::MAX)) as u32)
}

impl ThrottleConfig {
    /// Read one message's settings. Reads go through the config's tracked
    /// getters, so calling this inside a watcher subscribes to them.
    #[must_use]
    pub fn from_value(cfg: &Value) -> Self {
        let limit = cfg.get("limit");
        let interval = cfg.get("interval");

        let mut days_of_month: Vec<u32> = interval
            .get("daysOfMonth")
            .as_list()
            .map(|days| {
                days.to_vec()
                    .iter()
                    .filter_map(Value::as_f64)
                    .filter(|d| (1.0..=31.0).contains(d))
                    .map(|d| d as u32)
                    .collect()
            })
            .unwrap_or_default();

        let mut month_interval = interval.get("monthInterval").as_f64().map(|n| n.max(0.0) as u32);
        let day_interval = interval.get("dayInterval").as_f64().map(|n| n.max(0.0) as u32);
        if month_interval.is_none() && day_interval.is_none() {
            month_interval = Some(DEFAULT_MONTH_INTERVAL);
            if days_of_month.is_empty() {
                days_of_month.push(DEFAULT_DAY_OF_MONTH);
            }
        }

        Self {
            disabled: cfg.get("disabled").truthy(),
            limit: ThrottleLimit {
                sampling_rate: positive(&limit, "samplingRate").unwrap_or(DEFAULT_SAMPLING_RATE),
                max_send_number: positive(&limit, "maxSendNumber").unwrap_or(DEFAULT_MAX_SEND_NUMBER),
            },
            interval: ThrottleInterval {
                month_interval,
                day_interval,
                days_of_month,
            },
        }
    }
}
