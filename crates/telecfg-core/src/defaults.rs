#![forbid(unsafe_code)]

//! Declarative defaults applied onto a dynamic config.
//!
//! A [`ConfigDefaults`] schema maps property names to a [`DefaultValue`]:
//! either a literal, a [`DefaultCheck`] descriptor, or a nested schema (which
//! behaves like a merging descriptor whose default is the schema itself).
//!
//! For each entry the existing value wins unless it is null or undefined, or
//! the descriptor's validator rejects it. The winning value is written back
//! through the handler so the property becomes tracked, and then optionally
//! referenced or made read-only. Literal container defaults are deep-copied so
//! the schema is never shared with a live config.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::ConfigError;
use crate::handler::ConfigHandler;
use crate::logger::{LoggingSeverity, MessageId};
use crate::value::{AsContainer, ConfigFn, ConfigList, ConfigMap, ContainerRef, Key, Value, deep_copy};

/// Value predicate used by `is_val` and `df_val`.
pub type CheckFn = Rc<dyn Fn(&Value) -> bool>;

/// Value transform: `(current, default, config) -> value`.
pub type SetFn = Rc<dyn Fn(&Value, &Value, &Value) -> Value>;

// ─── Schema types ────────────────────────────────────────────────────────────

/// Ordered defaults schema.
#[derive(Clone, Default)]
pub struct ConfigDefaults {
    entries: IndexMap<String, DefaultValue>,
}

impl ConfigDefaults {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<DefaultValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<DefaultValue>) {
        self.entries.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DefaultValue> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DefaultValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ConfigDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

/// One schema entry.
#[derive(Clone)]
pub enum DefaultValue {
    Value(Value),
    Check(DefaultCheck),
    Nested(ConfigDefaults),
}

impl DefaultValue {
    fn as_literal(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => v.fmt(f),
            Self::Check(c) => c.fmt(f),
            Self::Nested(s) => s.fmt(f),
        }
    }
}

macro_rules! literal_default_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for DefaultValue {
            fn from(value: $ty) -> Self {
                Self::Value(value.into())
            }
        })*
    };
}

literal_default_from!(
    Value,
    bool,
    f64,
    i32,
    i64,
    u32,
    u64,
    usize,
    &str,
    String,
    ConfigMap,
    ConfigList,
    ConfigFn,
    serde_json::Value
);

impl From<DefaultCheck> for DefaultValue {
    fn from(check: DefaultCheck) -> Self {
        Self::Check(check)
    }
}

impl From<ConfigDefaults> for DefaultValue {
    fn from(schema: ConfigDefaults) -> Self {
        Self::Nested(schema)
    }
}

/// Descriptor controlling how one default is applied.
#[derive(Clone, Default)]
pub struct DefaultCheck {
    value: Option<Box<DefaultValue>>,
    fallbacks: Vec<String>,
    is_val: Option<CheckFn>,
    set_fn: Option<SetFn>,
    df_val: Option<CheckFn>,
    merge: bool,
    reference: Option<bool>,
    read_only: bool,
    block_value: bool,
}

impl DefaultCheck {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The default (`v`).
    #[must_use]
    pub fn value(mut self, value: impl Into<DefaultValue>) -> Self {
        self.value = Some(Box::new(value.into()));
        self
    }

    /// A sibling key whose value is used as the default when valid (`fb`).
    #[must_use]
    pub fn fallback(mut self, name: impl Into<String>) -> Self {
        self.fallbacks.push(name.into());
        self
    }

    #[must_use]
    pub fn fallbacks<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.fallbacks.extend(names.into_iter().map(Into::into));
        self
    }

    /// Validator for the existing value (`isVal`).
    #[must_use]
    pub fn is_val(mut self, check: impl Fn(&Value) -> bool + 'static) -> Self {
        self.is_val = Some(Rc::new(check));
        self
    }

    /// Transform producing the final value (`set`).
    #[must_use]
    pub fn set(mut self, set: impl Fn(&Value, &Value, &Value) -> Value + 'static) -> Self {
        self.set_fn = Some(Rc::new(set));
        self
    }

    /// Validity test for candidate defaults (`dfVal`); defaults to "is
    /// defined".
    #[must_use]
    pub fn df_val(mut self, check: impl Fn(&Value) -> bool + 'static) -> Self {
        self.df_val = Some(Rc::new(check));
        self
    }

    /// Merge the default's keys into an existing object (`mrg`).
    #[must_use]
    pub fn merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    /// Reference the resulting value (`ref`); defaults to `merge`.
    #[must_use]
    pub fn reference(mut self, reference: bool) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Make the resulting property read-only (`rdOnly`).
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Block conversion of the resulting value (`blkVal`).
    #[must_use]
    pub fn block_value(mut self, block: bool) -> Self {
        self.block_value = block;
        self
    }

    fn is_default_valid(&self, value: &Value) -> bool {
        match &self.df_val {
            Some(check) => check(value),
            None => value.is_defined(),
        }
    }
}

impl fmt::Debug for DefaultCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultCheck")
            .field("v", &self.value)
            .field("fb", &self.fallbacks)
            .field("mrg", &self.merge)
            .field("ref", &self.reference)
            .field("rdOnly", &self.read_only)
            .field("blkVal", &self.block_value)
            .finish_non_exhaustive()
    }
}

/// Shorthand constructors for common descriptors.
pub mod df {
    use super::{DefaultCheck, DefaultValue};
    use crate::value::{ConfigFn, Value};

    /// Keep the existing value only when `check` accepts it.
    pub fn validate(
        check: impl Fn(&Value) -> bool + 'static,
        default: impl Into<DefaultValue>,
    ) -> DefaultCheck {
        DefaultCheck::new().is_val(check).value(default)
    }

    /// Compute the value with `set`.
    pub fn set(
        set: impl Fn(&Value, &Value, &Value) -> Value + 'static,
        default: impl Into<DefaultValue>,
    ) -> DefaultCheck {
        DefaultCheck::new().set(set).value(default)
    }

    /// Merge `default`'s keys into the user's object and reference it.
    pub fn merge(default: impl Into<DefaultValue>) -> DefaultCheck {
        DefaultCheck::new().merge(true).value(default)
    }

    /// Boolean with a default; non-boolean input is replaced.
    #[must_use]
    pub fn boolean(default: bool) -> DefaultCheck {
        DefaultCheck::new().is_val(|v| v.as_bool().is_some()).value(default)
    }

    /// String with a default; non-string input is replaced.
    pub fn string(default: impl Into<String>) -> DefaultCheck {
        DefaultCheck::new()
            .is_val(|v| v.as_str().is_some())
            .value(default.into())
    }

    /// Function, defaulting to `null`.
    #[must_use]
    pub fn func(default: Option<ConfigFn>) -> DefaultCheck {
        let default = default.map_or(Value::Null, Value::Func);
        DefaultCheck::new().is_val(|v| v.as_func().is_some()).value(default)
    }

    /// Read-only property with a default.
    pub fn read_only(default: impl Into<DefaultValue>) -> DefaultCheck {
        DefaultCheck::new().read_only(true).value(default)
    }

    /// Property whose value is never made dynamic.
    pub fn block_value(default: impl Into<DefaultValue>) -> DefaultCheck {
        DefaultCheck::new().block_value(true).value(default)
    }
}

// ─── Application ─────────────────────────────────────────────────────────────

pub(crate) fn apply_defaults(handler: &ConfigHandler, target: &ContainerRef, defaults: &ConfigDefaults) {
    for (name, default) in defaults.iter() {
        apply_default_value(handler, target, name, default);
    }
}

/// Lazily resolved default, so fallbacks nested in a schema are only looked
/// up when the default is actually used.
struct Resolved<'a> {
    default: &'a DefaultValue,
    value: Option<Value>,
}

impl Resolved<'_> {
    fn get(&mut self, handler: &ConfigHandler, config: &ContainerRef) -> Value {
        if self.value.is_none() {
            self.value = Some(resolve_default_value(handler, config, self.default));
        }
        self.value.clone().unwrap_or_default()
    }
}

fn apply_default_value(handler: &ConfigHandler, config: &ContainerRef, name: &str, default: &DefaultValue) {
    let nested;
    let check = match default {
        DefaultValue::Check(check) => Some(check),
        DefaultValue::Nested(_) => {
            nested = DefaultCheck::new().merge(true).value(default.clone());
            Some(&nested)
        }
        DefaultValue::Value(_) => None,
    };
    let def_value = match check {
        Some(check) => get_default(handler, config, check),
        None => default.clone(),
    };
    let merge = check.is_some_and(|c| c.merge);
    let reference = check.is_some_and(|c| c.reference.unwrap_or(c.merge));
    let key = Key::from(name);

    if check.is_some_and(|c| c.block_value) {
        handler.blk_val(config, key.clone());
    }

    let mut resolved = Resolved {
        default: &def_value,
        value: None,
    };
    let mut the_value = config.read(&key);
    let mut using_default = the_value.is_null_or_undefined();

    if !using_default {
        if let Some(is_val) = check.and_then(|c| c.is_val.as_ref()) {
            let is_default = def_value.as_literal().is_some_and(|d| *d == the_value);
            if !is_default && !is_val(&the_value) {
                using_default = true;
            }
        }
        if let Some(set_fn) = check.and_then(|c| c.set_fn.as_ref()) {
            let default = resolved.get(handler, config);
            let current = if using_default { default.clone() } else { the_value.clone() };
            the_value = set_fn(&current, &default, &config.to_value());
            using_default = the_value == default;
        }
    }

    if using_default {
        the_value = resolved.get(handler, config);
    } else if merge {
        if let Some(node) = the_value.container_ref() {
            match &def_value {
                DefaultValue::Nested(schema) => apply_defaults(handler, &node, schema),
                DefaultValue::Value(Value::Map(map)) => {
                    for (k, v) in map.0.peek_entries() {
                        apply_default_value(handler, &node, &k.to_string(), &DefaultValue::Value(v));
                    }
                }
                _ => {}
            }
        }
    }

    if let Err(err) = handler.set(config, key.clone(), the_value) {
        report(handler, name, &err);
    }
    if reference {
        handler.reference(config, key.clone());
    }
    if check.is_some_and(|c| c.read_only) {
        handler.rd_only(config, key);
    }
}

/// First valid fallback, else `v` if valid, else undefined.
fn get_default(handler: &ConfigHandler, config: &ContainerRef, check: &DefaultCheck) -> DefaultValue {
    for name in &check.fallbacks {
        let key = Key::from(name);
        let value = config.read(&key);
        // Looking a fallback up makes it a tracked property of the config.
        if let Err(err) = handler.set(config, key, value.clone()) {
            report(handler, name, &err);
        }
        if check.is_default_valid(&value) {
            return DefaultValue::Value(value);
        }
    }

    match check.value.as_deref() {
        Some(DefaultValue::Value(v)) if !check.is_default_valid(v) => DefaultValue::Value(Value::Undefined),
        Some(default) => default.clone(),
        None => DefaultValue::Value(Value::Undefined),
    }
}

/// Materialize a default into a fresh value: literal containers are copied
/// and nested descriptors are resolved against `config`.
fn resolve_default_value(handler: &ConfigHandler, config: &ContainerRef, default: &DefaultValue) -> Value {
    match default {
        DefaultValue::Value(v) => deep_copy(v),
        DefaultValue::Check(check) => {
            let inner = get_default(handler, config, check);
            resolve_default_value(handler, config, &inner)
        }
        DefaultValue::Nested(schema) => Value::Map(ConfigMap::from_entries(
            schema
                .iter()
                .map(|(k, v)| (k, resolve_default_value(handler, config, v))),
        )),
    }
}

fn report(handler: &ConfigHandler, name: &str, err: &ConfigError) {
    crate::logger::report(
        handler.logger().as_deref(),
        LoggingSeverity::Warning,
        MessageId::DYNAMIC_CONFIG_EXCEPTION,
        &ConfigError::conversion(name, "Defaulting", err).to_string(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::create_dynamic_config;
    use serde_json::json;

    #[test]
    fn literal_default_fills_missing_and_null() {
        let handler = create_dynamic_config(Value::from(json!({"b": null, "c": 3})), None);
        let schema = ConfigDefaults::new().with("a", 1).with("b", "x").with("c", 9);
        handler.set_df(handler.cfg(), &schema);
        assert_eq!(handler.cfg().get("a"), Value::from(1));
        assert_eq!(handler.cfg().get("b"), Value::from("x"));
        assert_eq!(handler.cfg().get("c"), Value::from(3));
    }

    #[test]
    fn validator_replaces_rejected_value() {
        let handler = create_dynamic_config(Value::from(json!({"flag": "yes", "name": 5})), None);
        let schema = ConfigDefaults::new()
            .with("flag", df::boolean(true))
            .with("name", df::string("anon"));
        handler.set_df(handler.cfg(), &schema);
        assert_eq!(handler.cfg().get("flag"), Value::from(true));
        assert_eq!(handler.cfg().get("name"), Value::from("anon"));
    }

    #[test]
    fn set_fn_result_is_used() {
        let handler = create_dynamic_config(Value::from(json!({"n": 5})), None);
        let schema = ConfigDefaults::new().with(
            "n",
            df::set(
                |v, _, _| Value::from(v.as_f64().unwrap_or(0.0) * 2.0),
                1,
            ),
        );
        handler.set_df(handler.cfg(), &schema);
        assert_eq!(handler.cfg().get("n"), Value::from(10));
    }

    #[test]
    fn invalid_v_falls_through_to_undefined() {
        let handler = create_dynamic_config(Value::from(json!({})), None);
        let schema = ConfigDefaults::new().with(
            "x",
            DefaultCheck::new().value(0).df_val(|v| v.as_f64().is_some_and(|n| n > 0.0)),
        );
        handler.set_df(handler.cfg(), &schema);
        assert_eq!(handler.cfg().get("x"), Value::Undefined);
        assert!(handler.cfg().as_map().unwrap().contains_key("x"));
    }

    #[test]
    fn nested_schema_builds_fresh_object() {
        let handler = create_dynamic_config(Value::from(json!({})), None);
        let schema = ConfigDefaults::new().with(
            "ext",
            ConfigDefaults::new().with("level", 1).with("tags", Value::from(json!(["a"]))),
        );
        handler.set_df(handler.cfg(), &schema);
        let ext = handler.cfg().get("ext");
        assert_eq!(ext.to_json(), json!({"level": 1, "tags": ["a"]}));

        let again = create_dynamic_config(Value::from(json!({})), None);
        again.set_df(again.cfg(), &schema);
        assert_ne!(again.cfg().get("ext").get("tags"), ext.get("tags"));
    }
}
