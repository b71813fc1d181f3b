#![forbid(unsafe_code)]

//! Converting plain containers into tracked ones, and list mutation.
//!
//! Conversion is shallow: each key of the container becomes a tracked
//! property, and nested containers are converted lazily by the property
//! getter on first access. A failure anywhere is reported to the handler's
//! logger and the container is left partially converted; it never reaches the
//! caller.
//!
//! List mutators ([`ConfigList::push`] and friends) rebuild the value vector,
//! write shifted indices through their tracked setters, and re-run conversion
//! so that newly created indices are tracked too.

use std::rc::Rc;

use crate::error::{ConfigError, Result};
use crate::handler::HandlerCore;
use crate::logger::{LoggingSeverity, MessageId};
use crate::property::{DynProperty, PropertyFlags};
use crate::value::{AsContainer, ConfigList, ContainerRef, Key, Slot, Value};

/// Make every key of `target` a tracked property of `core`, then link the
/// container to `core` if it is not linked yet.
pub(crate) fn make_dynamic_object(core: &Rc<HandlerCore>, target: &ContainerRef, name: &str, desc: &str) {
    if let Err(err) = convert(core, target, name) {
        core.report(
            LoggingSeverity::Warning,
            MessageId::DYNAMIC_CONFIG_EXCEPTION,
            &ConfigError::conversion(name, desc, &err).to_string(),
        );
    }
}

fn convert(core: &Rc<HandlerCore>, target: &ContainerRef, name: &str) -> Result<()> {
    for key in target.keys() {
        match target.slot(&key) {
            Some(Slot::Tracked(prop)) if prop.is_owned_by(core) => {}
            _ => {
                let value = target.peek(&key);
                make_dynamic_property(core, target, key, value)?;
            }
        }
    }
    target.set_link(core, name)
}

/// Assign through this handler's tracked property, or replace whatever slot
/// is there with a new tracked property.
pub(crate) fn set_dynamic_property(
    core: &Rc<HandlerCore>,
    target: &ContainerRef,
    key: Key,
    value: Value,
) -> Result<()> {
    match target.slot(&key) {
        Some(Slot::Tracked(prop)) if prop.is_owned_by(core) => prop.set(target, value),
        _ => make_dynamic_property(core, target, key, value).map(|_| ()),
    }
}

fn make_dynamic_property(
    core: &Rc<HandlerCore>,
    target: &ContainerRef,
    key: Key,
    value: Value,
) -> Result<Rc<DynProperty>> {
    if target.is_frozen() {
        return Err(ConfigError::Frozen);
    }
    let prop = DynProperty::new(core, key.clone(), value);
    target.put_slot(&key, Slot::Tracked(Rc::clone(&prop)))?;
    Ok(prop)
}

/// Add `flags` to the property `key`, making it tracked first if needed.
pub(crate) fn set_dynamic_property_state(
    core: &Rc<HandlerCore>,
    target: &ContainerRef,
    key: Key,
    flags: PropertyFlags,
) -> Result<()> {
    let prop = match target.slot(&key) {
        Some(Slot::Tracked(prop)) if prop.is_owned_by(core) => prop,
        _ => {
            let value = target.peek(&key);
            make_dynamic_property(core, target, key, value)?
        }
    };
    prop.add_flags(flags);
    Ok(())
}

/// Mark a container so lazy conversion leaves it plain. Returns the value.
pub fn block_dynamic_conversion(value: &Value) -> Value {
    if let Some(node) = value.container_ref() {
        node.set_blocked(true);
    }
    value.clone()
}

/// Undo [`block_dynamic_conversion`]. Returns the value.
pub fn force_dynamic_conversion(value: &Value) -> Value {
    if let Some(node) = value.container_ref() {
        node.set_blocked(false);
    }
    value.clone()
}

// ─── List mutators ───────────────────────────────────────────────────────────

impl ConfigList {
    /// Append a value. Returns the new length.
    pub fn push(&self, value: impl Into<Value>) -> Result<usize> {
        let value = value.into();
        self.mutate(|values| {
            values.push(value);
            values.len()
        })
    }

    /// Remove and return the last value.
    pub fn pop(&self) -> Result<Value> {
        self.mutate(|values| values.pop().unwrap_or_default())
    }

    /// Remove and return the first value.
    pub fn shift(&self) -> Result<Value> {
        self.mutate(|values| {
            if values.is_empty() {
                Value::Undefined
            } else {
                values.remove(0)
            }
        })
    }

    /// Prepend a value. Returns the new length.
    pub fn unshift(&self, value: impl Into<Value>) -> Result<usize> {
        let value = value.into();
        self.mutate(|values| {
            values.insert(0, value);
            values.len()
        })
    }

    /// Remove `delete_count` values at `start` and insert `items` there.
    /// Out-of-range arguments are clamped. Returns the removed values.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        items: impl IntoIterator<Item = Value>,
    ) -> Result<Vec<Value>> {
        let items: Vec<Value> = items.into_iter().collect();
        self.mutate(|values| {
            let start = start.min(values.len());
            let end = start.saturating_add(delete_count).min(values.len());
            values.splice(start..end, items).collect()
        })
    }

    fn mutate<R>(&self, op: impl FnOnce(&mut Vec<Value>) -> R) -> Result<R> {
        let node = &self.0;
        if node.is_frozen() {
            return Err(ConfigError::Frozen);
        }

        let old = node.peek_values();
        let mut new = old.clone();
        let out = op(&mut new);

        let shared = old.len().min(new.len());
        for (idx, value) in new.iter().enumerate().take(shared) {
            if old[idx] != *value {
                node.write(&Key::Index(idx), value.clone())?;
            }
        }
        node.truncate(new.len());
        for (idx, value) in new.iter().enumerate().skip(old.len()) {
            node.put_slot(&Key::Index(idx), Slot::Plain(value.clone()))?;
        }

        if let Some(core) = node.link_core() {
            let name = node.link_name().unwrap_or_default();
            make_dynamic_object(&core, node, &name, "Patching");
        }
        Ok(out)
    }
}
