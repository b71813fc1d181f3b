#![forbid(unsafe_code)]

//! Config values and the shared containers they live in.
//!
//! # Design
//!
//! A configuration tree is made of [`Value`]s. Scalars are stored inline; maps
//! and lists are [`ConfigMap`] / [`ConfigList`] handles onto one shared
//! `Rc<RefCell<..>>` container, so cloning a handle never copies the content
//! and two handles are "the same object" exactly when they point at the same
//! allocation.
//!
//! Each key of a container holds a slot. A slot is either a plain value or a
//! tracked dynamic property owned by one config handler. Reads and writes made
//! through the public accessors are routed through the tracked property when
//! there is one, which is how the handler observes every access.
//!
//! # Invariants
//!
//! 1. `PartialEq` on [`Value`] is strict identity: scalars compare by value,
//!    containers, functions and opaque values compare by pointer.
//! 2. A container carries at most one back-link, to the handler that first
//!    materialized it.
//! 3. A frozen container rejects new keys and plain writes, but its tracked
//!    properties keep working.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::error::{ConfigError, Result};
use crate::handler::HandlerCore;
use crate::materialize::set_dynamic_property;
use crate::property::DynProperty;

// ─── Keys ────────────────────────────────────────────────────────────────────

/// Property name within a container: a map key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Name(String),
    Index(usize),
}

impl Key {
    fn map_key(&self) -> String {
        match self {
            Self::Name(name) => name.clone(),
            Self::Index(idx) => idx.to_string(),
        }
    }

    fn list_index(&self) -> Option<usize> {
        match self {
            Self::Index(idx) => Some(*idx),
            Self::Name(name) => name.parse().ok(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Index(idx) => write!(f, "{idx}"),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&String> for Key {
    fn from(name: &String) -> Self {
        Self::Name(name.clone())
    }
}

impl From<usize> for Key {
    fn from(idx: usize) -> Self {
        Self::Index(idx)
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

// ─── Function and opaque values ──────────────────────────────────────────────

/// A callable stored in configuration (hooks, validators, factories).
#[derive(Clone)]
pub struct ConfigFn(Rc<dyn Fn(&[Value]) -> Value>);

impl ConfigFn {
    pub fn new(f: impl Fn(&[Value]) -> Value + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> Value {
        (self.0)(args)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ConfigFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConfigFn")
    }
}

/// A host object that is not plain data (a logger, a storage backend).
///
/// Opaque values are passed through by reference: never copied, never made
/// dynamic.
#[derive(Clone)]
pub struct Opaque(Rc<dyn Any>);

impl Opaque {
    pub fn new<T: Any>(value: T) -> Self {
        Self(Rc::new(value))
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Opaque")
    }
}

// ─── Value ───────────────────────────────────────────────────────────────────

/// A configuration value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Func(ConfigFn),
    Opaque(Opaque),
    Map(ConfigMap),
    List(ConfigList),
}

impl Value {
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn is_defined(&self) -> bool {
        !self.is_undefined()
    }

    #[must_use]
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// Plain map or list.
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Map(_) | Self::List(_))
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&ConfigMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&ConfigList> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_func(&self) -> Option<&ConfigFn> {
        match self {
            Self::Func(f) => Some(f),
            _ => None,
        }
    }

    /// JavaScript-style truthiness, used by boolean coercions in defaults.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Read a property. Non-containers and missing keys read as `Undefined`.
    ///
    /// Reading a tracked property inside a watcher records it in that
    /// watcher's read-set.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        match self.container_ref() {
            Some(node) => node.read(&key.into()),
            None => Value::Undefined,
        }
    }

    /// Assign a property through its tracked setter, if it has one.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        match self.container_ref() {
            Some(node) => node.write(&key.into(), value.into()),
            None => Err(ConfigError::NotAContainer),
        }
    }

    /// Delete a property, dropping its tracking. Returns the removed value.
    pub fn remove(&self, key: impl Into<Key>) -> Option<Value> {
        self.container_ref()?.remove(&key.into())
    }

    /// Keys of a container; empty for scalars.
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.container_ref().map(|node| node.keys()).unwrap_or_default()
    }

    /// Structural equality, looking through container identity.
    #[must_use]
    pub fn deep_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Map(a), Self::Map(b)) => {
                if a.ptr_eq(b) {
                    return true;
                }
                let (ka, kb) = (a.keys(), b.keys());
                ka.len() == kb.len()
                    && ka.iter().all(|k| {
                        b.contains_key(k.clone()) && a.0.peek(k).deep_eq(&b.0.peek(k))
                    })
            }
            (Self::List(a), Self::List(b)) => {
                a.ptr_eq(b)
                    || (a.len() == b.len()
                        && (0..a.len()).all(|i| a.0.peek(&Key::Index(i)).deep_eq(&b.0.peek(&Key::Index(i)))))
            }
            _ => self == other,
        }
    }

    /// JSON rendering with `JSON.stringify` rules: undefined, functions and
    /// opaque values are dropped from maps and become `null` in lists.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Func(_) => "function",
            Self::Opaque(_) => "object",
            Self::Map(_) => "map",
            Self::List(_) => "list",
        }
    }

    fn skipped_in_json(&self) -> bool {
        matches!(self, Self::Undefined | Self::Func(_) | Self::Opaque(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Func(a), Self::Func(b)) => a.ptr_eq(b),
            (Self::Opaque(a), Self::Opaque(b)) => a.ptr_eq(b),
            (Self::Map(a), Self::Map(b)) => a.ptr_eq(b),
            (Self::List(a), Self::List(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Func(func) => func.fmt(f),
            Self::Opaque(opaque) => opaque.fmt(f),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Undefined | Self::Null | Self::Func(_) | Self::Opaque(_) => {
                serializer.serialize_unit()
            }
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => {
                if !n.is_finite() {
                    serializer.serialize_unit()
                } else if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            Self::String(s) => serializer.serialize_str(s),
            Self::Map(map) => {
                let entries: Vec<(String, Value)> = map
                    .0
                    .peek_entries()
                    .into_iter()
                    .filter(|(_, v)| !v.skipped_in_json())
                    .map(|(k, v)| (k.to_string(), v))
                    .collect();
                let mut out = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in &entries {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
            Self::List(list) => {
                let values = list.0.peek_values();
                let mut out = serializer.serialize_seq(Some(values.len()))?;
                for v in &values {
                    out.serialize_element(v)?;
                }
                out.end()
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(ConfigList::from_values(items.into_iter().map(Value::from)))
            }
            serde_json::Value::Object(fields) => Self::Map(ConfigMap::from_entries(
                fields.into_iter().map(|(k, v)| (k, Value::from(v))),
            )),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

macro_rules! number_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(n: $ty) -> Self {
                Self::Number(n as f64)
            }
        })*
    };
}

number_from!(i32, i64, u32, u64, usize);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<ConfigMap> for Value {
    fn from(map: ConfigMap) -> Self {
        Self::Map(map)
    }
}

impl From<ConfigList> for Value {
    fn from(list: ConfigList) -> Self {
        Self::List(list)
    }
}

impl From<ConfigFn> for Value {
    fn from(f: ConfigFn) -> Self {
        Self::Func(f)
    }
}

impl From<Opaque> for Value {
    fn from(o: Opaque) -> Self {
        Self::Opaque(o)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Undefined, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(ConfigList::from_values(items.into_iter().map(Into::into)))
    }
}

// ─── Container internals ─────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) enum Slot {
    Plain(Value),
    Tracked(Rc<DynProperty>),
}

impl Slot {
    fn peek(&self) -> Value {
        match self {
            Self::Plain(v) => v.clone(),
            Self::Tracked(prop) => prop.peek(),
        }
    }
}

pub(crate) enum Entries {
    Map(IndexMap<String, Slot>),
    List(Vec<Slot>),
}

/// Hidden back-link from a container to the handler that materialized it.
pub(crate) struct HandlerLink {
    pub(crate) core: Rc<HandlerCore>,
    pub(crate) name: String,
}

pub(crate) struct NodeInner {
    pub(crate) entries: Entries,
    pub(crate) link: Option<HandlerLink>,
    /// Skipped by lazy conversion in property getters and setters.
    pub(crate) blocked: bool,
    pub(crate) frozen: bool,
}

/// Opaque identity handle shared by [`ConfigMap`] and [`ConfigList`].
#[derive(Clone)]
pub struct ContainerRef(pub(crate) Rc<RefCell<NodeInner>>);

impl ContainerRef {
    fn new(entries: Entries) -> Self {
        Self(Rc::new(RefCell::new(NodeInner {
            entries,
            link: None,
            blocked: false,
            frozen: false,
        })))
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Whether a handler has materialized this container.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.0.borrow().link.is_some()
    }

    #[must_use]
    pub fn is_list(&self) -> bool {
        matches!(self.0.borrow().entries, Entries::List(_))
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<NodeInner>> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn to_value(&self) -> Value {
        if self.is_list() {
            Value::List(ConfigList(self.clone()))
        } else {
            Value::Map(ConfigMap(self.clone()))
        }
    }

    pub(crate) fn link_core(&self) -> Option<Rc<HandlerCore>> {
        self.0.borrow().link.as_ref().map(|link| Rc::clone(&link.core))
    }

    pub(crate) fn link_name(&self) -> Option<String> {
        self.0.borrow().link.as_ref().map(|link| link.name.clone())
    }

    pub(crate) fn set_link(&self, core: &Rc<HandlerCore>, name: &str) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.link.is_none() {
            if inner.frozen {
                return Err(ConfigError::Frozen);
            }
            inner.link = Some(HandlerLink {
                core: Rc::clone(core),
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.0.borrow().blocked
    }

    pub(crate) fn set_blocked(&self, blocked: bool) {
        self.0.borrow_mut().blocked = blocked;
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.0.borrow().frozen
    }

    pub(crate) fn slot(&self, key: &Key) -> Option<Slot> {
        let inner = self.0.borrow();
        match &inner.entries {
            Entries::Map(map) => map.get(&key.map_key()).cloned(),
            Entries::List(list) => key.list_index().and_then(|idx| list.get(idx).cloned()),
        }
    }

    /// Install a slot, growing a list with undefined holes when needed.
    pub(crate) fn put_slot(&self, key: &Key, slot: Slot) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        let frozen = inner.frozen;
        match &mut inner.entries {
            Entries::Map(map) => {
                let name = key.map_key();
                if frozen {
                    return Err(ConfigError::Frozen);
                }
                map.insert(name, slot);
            }
            Entries::List(list) => {
                let idx = key
                    .list_index()
                    .ok_or_else(|| ConfigError::conversion(key.to_string(), "Indexing", "not a list index"))?;
                if frozen {
                    return Err(ConfigError::Frozen);
                }
                if idx >= list.len() {
                    list.resize(idx + 1, Slot::Plain(Value::Undefined));
                }
                list[idx] = slot;
            }
        }
        Ok(())
    }

    pub(crate) fn keys(&self) -> Vec<Key> {
        match &self.0.borrow().entries {
            Entries::Map(map) => map.keys().map(|k| Key::Name(k.clone())).collect(),
            Entries::List(list) => (0..list.len()).map(Key::Index).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match &self.0.borrow().entries {
            Entries::Map(map) => map.len(),
            Entries::List(list) => list.len(),
        }
    }

    /// Tracked read: goes through the property getter when there is one.
    pub(crate) fn read(&self, key: &Key) -> Value {
        // The slot is cloned out so the getter runs without a borrow held.
        match self.slot(key) {
            Some(Slot::Plain(v)) => v,
            Some(Slot::Tracked(prop)) => prop.get(),
            None => Value::Undefined,
        }
    }

    /// Untracked read: no lazy conversion, no read-set recording.
    pub(crate) fn peek(&self, key: &Key) -> Value {
        self.slot(key).map(|slot| slot.peek()).unwrap_or_default()
    }

    pub(crate) fn peek_entries(&self) -> Vec<(Key, Value)> {
        self.keys()
            .into_iter()
            .map(|k| {
                let v = self.peek(&k);
                (k, v)
            })
            .collect()
    }

    pub(crate) fn peek_values(&self) -> Vec<Value> {
        self.peek_entries().into_iter().map(|(_, v)| v).collect()
    }

    /// Assign through the tracked setter. A key without one becomes a fresh
    /// tracked property when the container is linked, a plain slot otherwise.
    pub(crate) fn write(&self, key: &Key, value: Value) -> Result<()> {
        match self.slot(key) {
            Some(Slot::Tracked(prop)) => prop.set(self, value),
            _ => match self.link_core() {
                Some(core) => set_dynamic_property(&core, self, key.clone(), value),
                None => self.put_slot(key, Slot::Plain(value)),
            },
        }
    }

    pub(crate) fn remove(&self, key: &Key) -> Option<Value> {
        let mut inner = self.0.borrow_mut();
        if inner.frozen {
            return None;
        }
        let slot = match &mut inner.entries {
            Entries::Map(map) => map.shift_remove(&key.map_key()),
            Entries::List(list) => {
                // Deleting a list index leaves a hole, it does not shift.
                let idx = key.list_index()?;
                let slot = list.get_mut(idx)?;
                Some(std::mem::replace(slot, Slot::Plain(Value::Undefined)))
            }
        };
        drop(inner);
        slot.map(|s| s.peek())
    }

    pub(crate) fn truncate(&self, len: usize) {
        if let Entries::List(list) = &mut self.0.borrow_mut().entries {
            list.truncate(len);
        }
    }

    /// Container rendered for diagnostics.
    pub(crate) fn dump(&self) -> String {
        self.to_value().to_json().to_string()
    }
}

impl fmt::Debug for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}

/// Anything that may designate a config container.
pub trait AsContainer {
    /// The container, or `None` for scalars.
    fn container_ref(&self) -> Option<ContainerRef>;
}

impl AsContainer for Value {
    fn container_ref(&self) -> Option<ContainerRef> {
        match self {
            Self::Map(map) => Some(map.0.clone()),
            Self::List(list) => Some(list.0.clone()),
            _ => None,
        }
    }
}

impl AsContainer for ConfigMap {
    fn container_ref(&self) -> Option<ContainerRef> {
        Some(self.0.clone())
    }
}

impl AsContainer for ConfigList {
    fn container_ref(&self) -> Option<ContainerRef> {
        Some(self.0.clone())
    }
}

impl AsContainer for ContainerRef {
    fn container_ref(&self) -> Option<ContainerRef> {
        Some(self.clone())
    }
}

impl<T: AsContainer> AsContainer for &T {
    fn container_ref(&self) -> Option<ContainerRef> {
        (*self).container_ref()
    }
}

// ─── ConfigMap ───────────────────────────────────────────────────────────────

/// Insertion-ordered string-keyed config object.
#[derive(Clone)]
pub struct ConfigMap(pub(crate) ContainerRef);

impl ConfigMap {
    #[must_use]
    pub fn new() -> Self {
        Self(ContainerRef::new(Entries::Map(IndexMap::new())))
    }

    pub fn from_entries<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), Slot::Plain(v)))
            .collect();
        Self(ContainerRef::new(Entries::Map(map)))
    }

    /// Builder-style insert for literal construction.
    #[must_use]
    pub fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        // A fresh map is never frozen, so the insert cannot fail.
        let _ = self.0.put_slot(&Key::Name(key.into()), Slot::Plain(value.into()));
        self
    }

    pub fn get(&self, key: impl Into<Key>) -> Value {
        self.0.read(&key.into())
    }

    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.0.write(&key.into(), value.into())
    }

    pub fn remove(&self, key: impl Into<Key>) -> Option<Value> {
        self.0.remove(&key.into())
    }

    #[must_use]
    pub fn contains_key(&self, key: impl Into<Key>) -> bool {
        self.0.slot(&key.into()).is_some()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.0.keys()
    }

    /// Key/value pairs, read through the tracked getters.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0
            .keys()
            .into_iter()
            .map(|k| {
                let v = self.0.read(&k);
                (k.to_string(), v)
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject further structural changes and plain writes.
    pub fn freeze(&self) {
        self.0.0.borrow_mut().frozen = true;
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.0.is_frozen()
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.0.is_dynamic()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Default for ConfigMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConfigMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ─── ConfigList ──────────────────────────────────────────────────────────────

/// Index-addressed config array. Mutating operations live in the materializer
/// so they can re-track shifted indices.
#[derive(Clone)]
pub struct ConfigList(pub(crate) ContainerRef);

impl ConfigList {
    #[must_use]
    pub fn new() -> Self {
        Self(ContainerRef::new(Entries::List(Vec::new())))
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let list = values.into_iter().map(Slot::Plain).collect();
        Self(ContainerRef::new(Entries::List(list)))
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Value {
        self.0.read(&Key::Index(idx))
    }

    pub fn set(&self, idx: usize, value: impl Into<Value>) -> Result<()> {
        self.0.write(&Key::Index(idx), value.into())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values read through the tracked getters.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    pub fn freeze(&self) {
        self.0.0.borrow_mut().frozen = true;
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.0.is_dynamic()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Default for ConfigList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConfigList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Structural copy: maps and lists are copied recursively, everything else is
/// shared. Tracking is not copied; the result is plain.
#[must_use]
pub fn deep_copy(value: &Value) -> Value {
    match value {
        Value::Map(map) => Value::Map(ConfigMap::from_entries(
            map.0
                .peek_entries()
                .into_iter()
                .map(|(k, v)| (k.to_string(), deep_copy(&v))),
        )),
        Value::List(list) => Value::List(ConfigList::from_values(
            list.0.peek_values().iter().map(deep_copy),
        )),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_equality_is_identity_for_containers() {
        let a = ConfigMap::new().with("x", 1);
        let b = ConfigMap::new().with("x", 1);
        assert_eq!(Value::from(a.clone()), Value::from(a.clone()));
        assert_ne!(Value::from(a.clone()), Value::from(b.clone()));
        assert!(Value::from(a).deep_eq(&Value::from(b)));
        assert_eq!(Value::from("s"), Value::from("s".to_string()));
        assert_ne!(Value::Null, Value::Undefined);
    }

    #[test]
    fn json_conversion_follows_stringify_rules() {
        let value = Value::from(json!({"a": 1, "b": [true, null], "c": {"d": "x"}}));
        let map = value.as_map().expect("map");
        map.set("u", Value::Undefined).unwrap();
        map.set("f", ConfigFn::new(|_| Value::Null)).unwrap();
        assert_eq!(
            value.to_json(),
            json!({"a": 1, "b": [true, null], "c": {"d": "x"}})
        );

        let list = Value::from(vec![Value::Undefined, Value::from(1.5)]);
        assert_eq!(list.to_json(), json!([null, 1.5]));
    }

    #[test]
    fn map_keeps_insertion_order_and_removes() {
        let map = ConfigMap::new().with("b", 1).with("a", 2).with("c", 3);
        assert_eq!(
            map.keys(),
            vec![Key::from("b"), Key::from("a"), Key::from("c")]
        );
        assert_eq!(map.remove("a"), Some(Value::from(2)));
        assert!(!map.contains_key("a"));
        assert_eq!(map.get("a"), Value::Undefined);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn list_write_past_end_leaves_holes() {
        let list = ConfigList::new();
        list.set(2, "x").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(0), Value::Undefined);
        assert_eq!(list.get(2), Value::from("x"));
    }

    #[test]
    fn frozen_map_rejects_plain_writes() {
        let map = ConfigMap::new().with("a", 1);
        map.freeze();
        assert_eq!(map.set("a", 2), Err(ConfigError::Frozen));
        assert_eq!(map.set("b", 2), Err(ConfigError::Frozen));
        assert_eq!(map.remove("a"), None);
        assert_eq!(map.get("a"), Value::from(1));
    }

    #[test]
    fn scalar_access_reads_undefined() {
        let v = Value::from(5);
        assert_eq!(v.get("x"), Value::Undefined);
        assert_eq!(v.set("x", 1), Err(ConfigError::NotAContainer));
        assert!(v.keys().is_empty());
    }

    #[test]
    fn deep_copy_breaks_container_identity_only() {
        let shared_fn = ConfigFn::new(|_| Value::Null);
        let inner = ConfigMap::new().with("y", 2);
        let original = Value::from(
            ConfigMap::new()
                .with("inner", inner.clone())
                .with("hook", shared_fn.clone()),
        );
        let copy = deep_copy(&original);
        assert!(copy.deep_eq(&original));
        assert_ne!(copy.get("inner"), Value::from(inner));
        assert_eq!(copy.get("hook"), Value::from(shared_fn));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::from("").truthy());
        assert!(Value::from("a").truthy());
        assert!(!Value::from(0).truthy());
        assert!(!Value::Number(f64::NAN).truthy());
        assert!(Value::from(ConfigMap::new()).truthy());
    }

    #[test]
    fn integral_numbers_serialize_without_fraction() {
        assert_eq!(serde_json::to_string(&Value::from(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&Value::from(0.25)).unwrap(), "0.25");
        assert_eq!(
            serde_json::to_string(&Value::Number(f64::INFINITY)).unwrap(),
            "null"
        );
    }
}
