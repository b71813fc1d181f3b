#![forbid(unsafe_code)]

//! The dynamic config handler.
//!
//! # Design
//!
//! [`ConfigHandler`] is a cheap, clonable pair of the shared [`HandlerCore`]
//! and the root container. Containers converted by the handler point back at
//! the core; the core only holds the root weakly, so the graph has no strong
//! cycle and dropping every handle (and every reference to the config) frees
//! it.
//!
//! # Invariants
//!
//! 1. Creating a handler for a config that is already dynamic returns the
//!    existing handler; defaults are still applied.
//! 2. Only read-only violations propagate out of [`ConfigHandler::set`]; any
//!    other failure is logged.
//! 3. Allow-update windows nest and restore the previous setting on exit.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::defaults::{ConfigDefaults, apply_defaults};
use crate::error::{ConfigError, Result};
use crate::logger::{self, InternalLogger, LoggingSeverity, MessageId};
use crate::materialize::{make_dynamic_object, set_dynamic_property, set_dynamic_property_state};
use crate::property::PropertyFlags;
use crate::scheduler::{NotifyQueue, WatchHandle, WatcherFn};
use crate::value::{AsContainer, ConfigMap, ContainerRef, Key, NodeInner, Value, deep_copy};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

// ─── Core ────────────────────────────────────────────────────────────────────

pub(crate) struct HandlerCore {
    uid: String,
    root: Weak<RefCell<NodeInner>>,
    logger: Option<Rc<dyn InternalLogger>>,
    pub(crate) queue: NotifyQueue,
    allow_update: Cell<bool>,
}

impl HandlerCore {
    pub(crate) fn uid(&self) -> &str {
        &self.uid
    }

    pub(crate) fn allow_update(&self) -> bool {
        self.allow_update.get()
    }

    pub(crate) fn report(&self, severity: LoggingSeverity, id: MessageId, message: &str) {
        logger::report(self.logger.as_deref(), severity, id, message);
    }

    /// Run `f` with read-only checks relaxed (or re-enabled).
    pub(crate) fn with_allow_update<R>(&self, allow: bool, f: impl FnOnce() -> R) -> R {
        struct Restore<'a>(&'a Cell<bool>, bool);
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.0.set(self.1);
            }
        }

        let _restore = Restore(&self.allow_update, self.allow_update.replace(allow));
        f()
    }
}

// ─── Handler ─────────────────────────────────────────────────────────────────

/// Reactive handle onto one configuration tree.
#[derive(Clone)]
pub struct ConfigHandler {
    core: Rc<HandlerCore>,
    root: Value,
}

impl ConfigHandler {
    /// Start building a handler for `config`.
    pub fn builder(config: impl Into<Value>) -> ConfigHandlerBuilder {
        ConfigHandlerBuilder {
            config: config.into(),
            defaults: None,
            logger: None,
            in_place: true,
        }
    }

    pub(crate) fn from_core(core: &Rc<HandlerCore>) -> Option<Self> {
        let root = ContainerRef(core.root.upgrade()?).to_value();
        Some(Self {
            core: Rc::clone(core),
            root,
        })
    }

    /// Unique id of this handler, `dyncfg.<n>`.
    #[must_use]
    pub fn uid(&self) -> &str {
        self.core.uid()
    }

    /// The live configuration.
    #[must_use]
    pub fn cfg(&self) -> &Value {
        &self.root
    }

    #[must_use]
    pub fn logger(&self) -> Option<Rc<dyn InternalLogger>> {
        self.core.logger.clone()
    }

    /// Whether two handles refer to the same handler.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    /// Whether watchers are queued for the next notification.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.core.has_pending()
    }

    /// Set `name` on `target` as a tracked property and return the value as
    /// stored.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ReadOnly`] when `name` is read-only and no allow-update
    /// window is open. Other failures are logged and the value is returned
    /// as given.
    pub fn set(
        &self,
        target: &impl AsContainer,
        name: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<Value> {
        let value = value.into();
        let Some(node) = target.container_ref() else {
            return Ok(value);
        };
        let key = name.into();
        match set_dynamic_property(&self.core, &node, key.clone(), value.clone()) {
            Ok(()) => Ok(node.peek(&key)),
            Err(err) if err.is_read_only() => Err(err),
            Err(err) => {
                self.core.report(
                    LoggingSeverity::Warning,
                    MessageId::DYNAMIC_CONFIG_EXCEPTION,
                    &ConfigError::conversion(key.to_string(), "Setting", &err).to_string(),
                );
                Ok(value)
            }
        }
    }

    /// Apply `defaults` to `target` with read-only checks relaxed, and
    /// return `target`.
    pub fn set_df(&self, target: &impl AsContainer, defaults: &ConfigDefaults) -> Value {
        let Some(node) = target.container_ref() else {
            return Value::Undefined;
        };
        self.core
            .with_allow_update(true, || apply_defaults(self, &node, defaults));
        node.to_value()
    }

    /// Register `callback`; it runs immediately and again after any
    /// property it read changes.
    pub fn watch(&self, callback: impl Fn(&WatchDetails<'_>) -> Result<()> + 'static) -> WatchHandle {
        let func: WatcherFn = Rc::new(callback);
        self.core.watch(func)
    }

    /// Run pending watchers now instead of waiting for the timer.
    pub fn notify(&self) {
        self.core.notify();
    }

    /// Keep the object currently stored at `name`: later assignments copy
    /// into it. Returns the current value.
    pub fn reference(&self, target: &impl AsContainer, name: impl Into<Key>) -> Value {
        self.set_state(target, name.into(), PropertyFlags::REFERENCED)
    }

    /// Make `name` read-only. Returns the current value.
    pub fn rd_only(&self, target: &impl AsContainer, name: impl Into<Key>) -> Value {
        self.set_state(target, name.into(), PropertyFlags::READ_ONLY)
    }

    /// Stop `name`'s value from being converted. Returns the current value.
    pub fn blk_val(&self, target: &impl AsContainer, name: impl Into<Key>) -> Value {
        self.set_state(target, name.into(), PropertyFlags::BLOCKED)
    }

    fn set_state(&self, target: &impl AsContainer, key: Key, flags: PropertyFlags) -> Value {
        let Some(node) = target.container_ref() else {
            return Value::Undefined;
        };
        if let Err(err) = set_dynamic_property_state(&self.core, &node, key.clone(), flags) {
            self.core.report(
                LoggingSeverity::Warning,
                MessageId::DYNAMIC_CONFIG_EXCEPTION,
                &ConfigError::conversion(key.to_string(), "Setting", &err).to_string(),
            );
        }
        node.peek(&key)
    }

    /// Run `callback` without dependency tracking, optionally inside an
    /// allow-update window. Errors from the callback are logged.
    pub fn block(&self, allow_update: Option<bool>, callback: impl FnOnce(&WatchDetails<'_>) -> Result<()>) {
        let run = || {
            let details = WatchDetails::new(self);
            self.core.with_active(None, || callback(&details))
        };
        let result = match allow_update {
            Some(allow) => self.core.with_allow_update(allow, run),
            None => run(),
        };
        if let Err(err) = result {
            self.core.report(
                LoggingSeverity::Critical,
                MessageId::CONFIG_WATCHER_EXCEPTION,
                &format!("Blocked callback failed: {err}"),
            );
        }
    }
}

impl fmt::Debug for ConfigHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigHandler")
            .field("uid", &self.core.uid)
            .field("cfg", &self.root)
            .finish()
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Options for [`ConfigHandler::builder`].
pub struct ConfigHandlerBuilder {
    config: Value,
    defaults: Option<ConfigDefaults>,
    logger: Option<Rc<dyn InternalLogger>>,
    in_place: bool,
}

impl ConfigHandlerBuilder {
    /// Defaults applied after creation.
    #[must_use]
    pub fn defaults(mut self, defaults: ConfigDefaults) -> Self {
        self.defaults = Some(defaults);
        self
    }

    #[must_use]
    pub fn logger(mut self, logger: Rc<dyn InternalLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Convert the given config itself (default) or a deep copy of it.
    #[must_use]
    pub fn in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }

    pub fn build(self) -> ConfigHandler {
        let handler = match get_dynamic_config_handler(&self.config) {
            Some(existing) => existing,
            None => {
                let root = match &self.config {
                    Value::Map(_) | Value::List(_) if self.in_place => self.config.clone(),
                    Value::Map(_) | Value::List(_) => deep_copy(&self.config),
                    _ => Value::Map(ConfigMap::new()),
                };
                match root.container_ref() {
                    Some(node) => create_handler(node, self.logger),
                    None => create_handler(ConfigMap::new().0, self.logger),
                }
            }
        };

        if let Some(defaults) = &self.defaults {
            handler.set_df(handler.cfg(), defaults);
        }
        handler
    }
}

fn create_handler(node: ContainerRef, logger: Option<Rc<dyn InternalLogger>>) -> ConfigHandler {
    let core = Rc::new(HandlerCore {
        uid: format!("dyncfg.{}", NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed)),
        root: node.downgrade(),
        logger,
        queue: NotifyQueue::default(),
        allow_update: Cell::new(false),
    });
    tracing::debug!(uid = %core.uid, "config handler created");

    make_dynamic_object(&core, &node, "config", "Creating");
    ConfigHandler {
        core,
        root: node.to_value(),
    }
}

// ─── Watch details ───────────────────────────────────────────────────────────

/// Context passed to watcher callbacks.
pub struct WatchDetails<'a> {
    handler: &'a ConfigHandler,
}

impl<'a> WatchDetails<'a> {
    pub(crate) fn new(handler: &'a ConfigHandler) -> Self {
        Self { handler }
    }

    /// The live configuration; reads through it are tracked.
    #[must_use]
    pub fn cfg(&self) -> &Value {
        self.handler.cfg()
    }

    #[must_use]
    pub fn handler(&self) -> &ConfigHandler {
        self.handler
    }

    pub fn set(
        &self,
        target: &impl AsContainer,
        name: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<Value> {
        self.handler.set(target, name, value)
    }

    pub fn set_df(&self, target: &impl AsContainer, defaults: &ConfigDefaults) -> Value {
        self.handler.set_df(target, defaults)
    }

    pub fn reference(&self, target: &impl AsContainer, name: impl Into<Key>) -> Value {
        self.handler.reference(target, name)
    }

    pub fn rd_only(&self, target: &impl AsContainer, name: impl Into<Key>) -> Value {
        self.handler.rd_only(target, name)
    }

    pub fn blk_val(&self, target: &impl AsContainer, name: impl Into<Key>) -> Value {
        self.handler.blk_val(target, name)
    }
}

// ─── Free functions ──────────────────────────────────────────────────────────

/// Make `config` dynamic (or fetch its existing handler) and apply
/// `defaults`.
pub fn create_dynamic_config(
    config: impl Into<Value>,
    defaults: Option<&ConfigDefaults>,
) -> ConfigHandler {
    let mut builder = ConfigHandler::builder(config);
    if let Some(defaults) = defaults {
        builder = builder.defaults(defaults.clone());
    }
    builder.build()
}

/// The handler that converted `value`, if any.
pub fn get_dynamic_config_handler(value: &impl AsContainer) -> Option<ConfigHandler> {
    let node = value.container_ref()?;
    let core = node.link_core()?;
    ConfigHandler::from_core(&core)
}

/// Watch `config` for changes.
///
/// A config that is not dynamic yet is converted on the fly when a logger is
/// given, with a warning.
///
/// # Errors
///
/// [`ConfigError::InvalidAccess`] when `config` is not dynamic and no logger
/// is available.
pub fn on_config_change(
    config: &Value,
    callback: impl Fn(&WatchDetails<'_>) -> Result<()> + 'static,
    logger: Option<Rc<dyn InternalLogger>>,
) -> Result<WatchHandle> {
    if let Some(handler) = get_dynamic_config_handler(config) {
        return Ok(handler.watch(callback));
    }

    let message = format!("Not dynamic - {}", config.to_json());
    match logger {
        Some(logger) => {
            logger.warn_to_console(&message);
            logger.throw_internal(
                LoggingSeverity::Warning,
                MessageId::DYNAMIC_CONFIG_EXCEPTION,
                &message,
                false,
            );
            let handler = ConfigHandler::builder(config.clone()).logger(logger).build();
            Ok(handler.watch(callback))
        }
        None => Err(ConfigError::InvalidAccess(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryLogger;
    use serde_json::json;

    fn map(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    #[test]
    fn uid_has_expected_prefix_and_is_unique() {
        let a = create_dynamic_config(map(json!({})), None);
        let b = create_dynamic_config(map(json!({})), None);
        assert!(a.uid().starts_with("dyncfg."));
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn non_container_config_becomes_empty_map() {
        let handler = create_dynamic_config(Value::from(42), None);
        assert!(handler.cfg().as_map().is_some_and(ConfigMap::is_empty));
        assert!(get_dynamic_config_handler(handler.cfg()).is_some());
    }

    #[test]
    fn copying_builder_leaves_input_plain() {
        let input = map(json!({"a": 1}));
        let handler = ConfigHandler::builder(input.clone()).in_place(false).build();
        assert_ne!(handler.cfg(), &input);
        assert!(get_dynamic_config_handler(&input).is_none());
        assert_eq!(handler.cfg().get("a"), Value::from(1));
    }

    #[test]
    fn allow_update_window_restores_previous_setting() {
        let handler = create_dynamic_config(map(json!({})), None);
        assert!(!handler.core.allow_update());
        handler.core.with_allow_update(true, || {
            assert!(handler.core.allow_update());
            handler
                .core
                .with_allow_update(false, || assert!(!handler.core.allow_update()));
            assert!(handler.core.allow_update());
        });
        assert!(!handler.core.allow_update());
    }

    #[test]
    fn set_on_frozen_container_is_logged_not_returned() {
        let logger = Rc::new(MemoryLogger::new());
        let handler = ConfigHandler::builder(map(json!({})))
            .logger(logger.clone())
            .build();
        let frozen = ConfigMap::new();
        frozen.freeze();
        let out = handler.set(&frozen, "x", 1).expect("not read-only");
        assert_eq!(out, Value::from(1));
        assert_eq!(logger.with_id(MessageId::DYNAMIC_CONFIG_EXCEPTION).len(), 1);
    }

    #[test]
    fn handler_drops_with_its_config() {
        let handler = create_dynamic_config(map(json!({"a": {"b": 1}})), None);
        let weak = Rc::downgrade(&handler.core);
        let _ = handler.cfg().get("a").get("b");
        drop(handler);
        assert!(weak.upgrade().is_none());
    }
}
