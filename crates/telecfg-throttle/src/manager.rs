#![forbid(unsafe_code)]

//! Throttle manager: lets a sampled, interval-bound subset of internal
//! messages through and persists how many were held back.
//!
//! Settings are read from `throttleMgrCfg` inside a config watcher, so edits
//! to the live config apply to the next message. Until [`ThrottleMgr::on_ready_state`]
//! marks the manager ready, messages are queued per id and replayed on flush.
//!
//! # Invariants
//!
//! 1. A message id triggers at most once per UTC day.
//! 2. A trigger sends `min(maxSendNumber, count + 1)` copies and resets the
//!    persisted count; every other message increments it.
//! 3. Without usable storage nothing is ever throttled through.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use chrono::{DateTime, Datelike, Utc};
use telecfg_core::{
    ConfigDefaults, ConfigHandler, ConfigMap, InternalLogger, LoggingSeverity, MessageId, Value,
    WatchHandle,
};

use crate::config::{SAMPLING_SCALE, ThrottleConfig};
use crate::error::ThrottleError;
use crate::storage::{MemoryStorage, ThrottleState, ThrottleStorage, start_of_day, storage_key};

const CONFIG_KEY: &str = "throttleMgrCfg";

// ─── Injectable sources ──────────────────────────────────────────────────────

/// Source of the current time.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of sampling draws.
pub trait RandomSource {
    /// Uniform integer in `0..=max`.
    fn random_up_to(&self, max: u32) -> u32;
}

/// Draws from the operating system's entropy source.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn random_up_to(&self, max: u32) -> u32 {
        match getrandom::u32() {
            Ok(raw) => match max.checked_add(1) {
                Some(span) => raw % span,
                None => raw,
            },
            // Never sample in when entropy is unavailable.
            Err(_) => max,
        }
    }
}

// ─── Interval math ───────────────────────────────────────────────────────────

/// Position of `current` on an interval grid anchored at `start`.
///
/// Returns `1` for a non-positive interval, the 1-based step number when
/// `current` lands on the grid, and `-1` otherwise.
#[must_use]
pub fn check_interval(interval: i64, start: i64, current: i64) -> i64 {
    if interval <= 0 {
        return 1;
    }
    let span = current - start;
    if current >= start && span % interval == 0 {
        span / interval + 1
    } else {
        -1
    }
}

fn months_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    i64::from(to.year() - from.year()) * 12 + i64::from(to.month()) - i64::from(from.month())
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Outcome of [`ThrottleMgr::send_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThrottleResult {
    /// Whether this call triggered.
    pub is_throttled: bool,
    /// Copies of the message that were sent.
    pub throttle_num: u32,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: String,
    severity: Option<LoggingSeverity>,
}

pub struct ThrottleMgr {
    handler: ConfigHandler,
    logger: Option<Rc<dyn InternalLogger>>,
    storage: Rc<dyn ThrottleStorage>,
    clock: Rc<dyn Clock>,
    random: Rc<dyn RandomSource>,
    prefix: String,
    configs: RefCell<BTreeMap<MessageId, ThrottleConfig>>,
    triggered: RefCell<BTreeMap<MessageId, bool>>,
    queue: RefCell<BTreeMap<MessageId, Vec<QueuedMessage>>>,
    ready: Cell<bool>,
    watcher: RefCell<Option<WatchHandle>>,
}

impl ThrottleMgr {
    /// Start building a manager whose settings live in `config`.
    pub fn builder(config: impl Into<Value>) -> ThrottleMgrBuilder {
        ThrottleMgrBuilder {
            config: config.into(),
            logger: None,
            storage: None,
            clock: Rc::new(SystemClock),
            random: Rc::new(OsRandom),
            prefix: String::new(),
        }
    }

    /// The config handler the manager reads its settings through.
    #[must_use]
    pub fn handler(&self) -> &ConfigHandler {
        &self.handler
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.get()
    }

    /// Effective settings for `id`, falling back to the default key.
    #[must_use]
    pub fn config(&self, id: MessageId) -> ThrottleConfig {
        let configs = self.configs.borrow();
        configs
            .get(&id)
            .or_else(|| configs.get(&MessageId::DEFAULT_THROTTLE_MSG_KEY))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `id` is enabled, has storage and is on its interval today.
    /// Sampling is not consulted.
    #[must_use]
    pub fn can_throttle(&self, id: MessageId) -> bool {
        self.load_state(id)
            .is_some_and(|state| self.within_interval(&self.config(id), &state))
    }

    /// Whether `id` already triggered today.
    #[must_use]
    pub fn is_triggered(&self, id: MessageId) -> bool {
        let state = self.load_state(id);
        self.triggered_today(id, state.as_ref())
    }

    /// Offer a message. Returns `None` while the manager is not ready; the
    /// message is then queued until a flush.
    pub fn send_message(
        &self,
        id: MessageId,
        message: &str,
        severity: Option<LoggingSeverity>,
    ) -> Option<ThrottleResult> {
        if !self.ready.get() {
            self.queue
                .borrow_mut()
                .entry(id)
                .or_default()
                .push(QueuedMessage {
                    message: message.to_owned(),
                    severity,
                });
            tracing::trace!(message_id = id.0, "throttle message queued until ready");
            return None;
        }

        let cfg = self.config(id);
        let now = self.clock.now();
        let mut state = self.load_state(id);
        let can_throttle = state
            .as_ref()
            .is_some_and(|s| self.within_interval(&cfg, s))
            && self.sampled_in(&cfg);
        let already = self.triggered_today(id, state.as_ref());

        let mut result = ThrottleResult::default();
        if can_throttle && !already {
            if let Some(state) = state.as_mut() {
                result.throttle_num = cfg.limit.max_send_number.min(state.count.saturating_add(1));
                state.count = 0;
                state.pre_trigger_date = Some(start_of_day(now));
            }
            result.is_throttled = true;
            self.triggered.borrow_mut().insert(id, true);
        } else {
            self.triggered.borrow_mut().insert(id, can_throttle);
            if let Some(state) = state.as_mut() {
                state.count = state.count.saturating_add(1);
            }
        }

        if let Some(state) = &state {
            let key = storage_key(&self.prefix, id);
            if let Err(err) = state.store(self.storage.as_ref(), &key) {
                tracing::warn!(key = %key, %err, "failed to persist throttle state");
            }
        }

        for _ in 0..result.throttle_num {
            self.emit(id, message, severity);
        }
        Some(result)
    }

    /// Set the ready state (`None` means ready) and optionally flush every
    /// queued message. Returns the flush outcome when a flush ran.
    pub fn on_ready_state(&self, is_ready: Option<bool>, flush_all: bool) -> Option<bool> {
        self.ready.set(is_ready.unwrap_or(true));
        if self.ready.get() && flush_all {
            return Some(self.flush_all());
        }
        None
    }

    /// Replay the messages queued for `id`. Returns whether any were queued.
    pub fn flush(&self, id: MessageId) -> bool {
        let Some(items) = self.queue.borrow_mut().remove(&id) else {
            return false;
        };
        if items.is_empty() {
            return false;
        }
        for item in &items {
            let _ = self.send_message(id, &item.message, item.severity);
        }
        true
    }

    /// Replay every queued message.
    pub fn flush_all(&self) -> bool {
        let ids: Vec<MessageId> = self.queue.borrow().keys().copied().collect();
        let mut flushed = false;
        for id in ids {
            flushed |= self.flush(id);
        }
        flushed
    }

    /// Number of messages waiting for a flush.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.borrow().values().map(Vec::len).sum()
    }

    /// Stop following config changes and drop queued messages.
    pub fn unload(&self) {
        if let Some(handle) = self.watcher.borrow_mut().take() {
            handle.rm();
        }
        self.queue.borrow_mut().clear();
        self.ready.set(false);
    }

    fn load_state(&self, id: MessageId) -> Option<ThrottleState> {
        if !self.storage.is_available() {
            return None;
        }
        let key = storage_key(&self.prefix, id);
        match ThrottleState::load(self.storage.as_ref(), &key) {
            Ok(Some(state)) => return Some(state),
            Ok(None) => {}
            Err(ThrottleError::Serialization(err)) => {
                tracing::warn!(key = %key, %err, "discarding unreadable throttle state");
            }
            Err(err) => {
                tracing::warn!(key = %key, %err, "throttle storage unusable");
                return None;
            }
        }

        let state = ThrottleState::new(self.clock.now());
        match state.store(self.storage.as_ref(), &key) {
            Ok(()) => Some(state),
            Err(err) => {
                tracing::warn!(key = %key, %err, "failed to persist throttle state");
                None
            }
        }
    }

    fn within_interval(&self, cfg: &ThrottleConfig, state: &ThrottleState) -> bool {
        if cfg.disabled {
            return false;
        }
        let today = start_of_day(self.clock.now());
        let interval = &cfg.interval;

        let month_check = match interval.month_interval {
            Some(months) if months > 0 => {
                check_interval(i64::from(months), 0, months_between(state.date, today))
            }
            _ => 1,
        };

        let day_check = if !interval.days_of_month.is_empty() {
            if interval.days_of_month.contains(&today.day()) { 1 } else { -1 }
        } else {
            match interval.day_interval {
                Some(days) if days > 0 => {
                    check_interval(i64::from(days), 0, (today - state.date).num_days())
                }
                _ => 1,
            }
        };

        month_check >= 0 && day_check >= 0
    }

    fn sampled_in(&self, cfg: &ThrottleConfig) -> bool {
        self.random.random_up_to(SAMPLING_SCALE) <= cfg.limit.sampling_rate
    }

    fn triggered_today(&self, id: MessageId, state: Option<&ThrottleState>) -> bool {
        let flagged = self.triggered.borrow().get(&id).copied().unwrap_or(false);
        let today = start_of_day(self.clock.now());
        flagged
            || state
                .and_then(|s| s.pre_trigger_date)
                .is_some_and(|date| start_of_day(date) == today)
    }

    fn emit(&self, id: MessageId, message: &str, severity: Option<LoggingSeverity>) {
        let severity = severity.unwrap_or(LoggingSeverity::Critical);
        match &self.logger {
            Some(logger) => logger.throw_internal(severity, id, message, false),
            None => match severity {
                LoggingSeverity::Critical => tracing::error!(message_id = id.0, "{message}"),
                LoggingSeverity::Warning => tracing::warn!(message_id = id.0, "{message}"),
                _ => tracing::info!(message_id = id.0, "{message}"),
            },
        }
    }
}

impl fmt::Debug for ThrottleMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleMgr")
            .field("handler", &self.handler.uid())
            .field("prefix", &self.prefix)
            .field("ready", &self.ready.get())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

pub struct ThrottleMgrBuilder {
    config: Value,
    logger: Option<Rc<dyn InternalLogger>>,
    storage: Option<Rc<dyn ThrottleStorage>>,
    clock: Rc<dyn Clock>,
    random: Rc<dyn RandomSource>,
    prefix: String,
}

impl ThrottleMgrBuilder {
    /// Logger that receives the messages let through.
    #[must_use]
    pub fn logger(mut self, logger: Rc<dyn InternalLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Persistent store; defaults to a fresh [`MemoryStorage`].
    #[must_use]
    pub fn storage(mut self, storage: Rc<dyn ThrottleStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn random(mut self, random: Rc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Extra storage key prefix, for several managers sharing one store.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn build(self) -> Rc<ThrottleMgr> {
        let mut builder = ConfigHandler::builder(self.config)
            .defaults(ConfigDefaults::new().with(CONFIG_KEY, ConfigMap::new()));
        if let Some(logger) = &self.logger {
            builder = builder.logger(Rc::clone(logger));
        }
        let handler = builder.build();

        let mgr = Rc::new(ThrottleMgr {
            handler: handler.clone(),
            logger: self.logger,
            storage: self
                .storage
                .unwrap_or_else(|| Rc::new(MemoryStorage::new())),
            clock: self.clock,
            random: self.random,
            prefix: self.prefix,
            configs: RefCell::new(BTreeMap::new()),
            triggered: RefCell::new(BTreeMap::new()),
            queue: RefCell::new(BTreeMap::new()),
            ready: Cell::new(false),
            watcher: RefCell::new(None),
        });

        let weak: Weak<ThrottleMgr> = Rc::downgrade(&mgr);
        let handle = handler.watch(move |details| {
            let Some(mgr) = weak.upgrade() else {
                return Ok(());
            };
            let all = details.cfg().get(CONFIG_KEY);
            let mut configs = BTreeMap::new();
            for key in all.keys() {
                match key.to_string().parse::<u32>() {
                    Ok(id) => {
                        configs.insert(MessageId(id), ThrottleConfig::from_value(&all.get(key)));
                    }
                    Err(_) => tracing::debug!(%key, "ignoring non-numeric throttle config key"),
                }
            }
            configs
                .entry(MessageId::DEFAULT_THROTTLE_MSG_KEY)
                .or_insert_with(ThrottleConfig::default);
            *mgr.configs.borrow_mut() = configs;
            Ok(())
        });
        *mgr.watcher.borrow_mut() = Some(handle);
        tracing::debug!(uid = handler.uid(), "throttle manager created");
        mgr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    struct FixedClock(Cell<DateTime<Utc>>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0.get()
        }
    }

    struct FixedRandom(u32);

    impl RandomSource for FixedRandom {
        fn random_up_to(&self, max: u32) -> u32 {
            self.0.min(max)
        }
    }

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).unwrap()
    }

    fn mgr_at(config: serde_json::Value, now: DateTime<Utc>, draw: u32) -> Rc<ThrottleMgr> {
        ThrottleMgr::builder(Value::from(config))
            .clock(Rc::new(FixedClock(Cell::new(now))))
            .random(Rc::new(FixedRandom(draw)))
            .build()
    }

    #[test]
    fn check_interval_grid() {
        assert_eq!(check_interval(0, 0, 17), 1);
        assert_eq!(check_interval(3, 0, 0), 1);
        assert_eq!(check_interval(3, 0, 6), 3);
        assert_eq!(check_interval(3, 0, 7), -1);
        assert_eq!(check_interval(3, 5, 2), -1);
    }

    #[test]
    fn months_between_spans_years() {
        assert_eq!(months_between(day(2023, 11, 1), day(2024, 2, 1)), 3);
        assert_eq!(months_between(day(2024, 2, 1), day(2024, 2, 29)), 0);
    }

    #[test]
    fn default_key_always_configured() {
        let mgr = mgr_at(json!({}), day(2024, 1, 28), 0);
        let fallback = mgr.config(MessageId(9999));
        assert_eq!(fallback, ThrottleConfig::default());
        assert_eq!(mgr.config(MessageId::DEFAULT_THROTTLE_MSG_KEY), fallback);
    }

    #[test]
    fn default_interval_fires_on_the_28th() {
        let mgr = mgr_at(json!({}), day(2024, 1, 28), 0);
        assert!(mgr.can_throttle(MessageId(1)));

        let off_day = mgr_at(json!({}), day(2024, 1, 27), 0);
        assert!(!off_day.can_throttle(MessageId(1)));
    }

    #[test]
    fn disabled_config_never_throttles() {
        let mgr = mgr_at(
            json!({"throttleMgrCfg": {"5": {"disabled": true, "interval": {"dayInterval": 1}}}}),
            day(2024, 3, 3),
            0,
        );
        assert!(!mgr.can_throttle(MessageId(5)));
    }

    #[test]
    fn unready_messages_queue() {
        let mgr = mgr_at(json!({}), day(2024, 1, 28), 0);
        assert_eq!(mgr.send_message(MessageId(1), "m", None), None);
        assert_eq!(mgr.queued(), 1);
        assert!(!mgr.is_ready());
        assert_eq!(mgr.on_ready_state(None, true), Some(true));
        assert_eq!(mgr.queued(), 0);
        assert!(mgr.is_triggered(MessageId(1)));
    }

    #[test]
    fn sampling_out_counts_without_sending() {
        let mgr = mgr_at(json!({}), day(2024, 1, 28), SAMPLING_SCALE);
        mgr.on_ready_state(Some(true), false);
        let result = mgr.send_message(MessageId(1), "m", None).unwrap();
        assert_eq!(result, ThrottleResult::default());
        assert!(!mgr.is_triggered(MessageId(1)));
    }
}
