#![forbid(unsafe_code)]

//! Tracked dynamic properties.
//!
//! A [`DynProperty`] replaces a plain slot once a handler materializes its
//! container. Its getter records the active watcher and lazily converts nested
//! containers; its setter enforces read-only state, keeps referenced
//! containers stable, and queues the watchers that read it.
//!
//! # Invariants
//!
//! 1. A property belongs to exactly one handler core for its whole life.
//! 2. The watcher list and each watcher's read-set mirror each other: a
//!    registration appears in `watchers` iff the property is in its read-set.
//! 3. Writing the identical value is a no-op: no checks, no notification.
//! 4. A referenced container value keeps its identity across assignments; the
//!    assigned value's keys are copied into it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bitflags::bitflags;

use crate::error::{ConfigError, Result};
use crate::handler::HandlerCore;
use crate::logger::{LoggingSeverity, MessageId};
use crate::materialize::{make_dynamic_object, set_dynamic_property};
use crate::scheduler::Registration;
use crate::value::{AsContainer, ContainerRef, Key, Slot, Value};

bitflags! {
    /// Per-property state set through `ref`, `rd_only` and `blk_val`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct PropertyFlags: u8 {
        /// Keep the current container object on assignment.
        const REFERENCED = 1 << 0;
        /// Reject assignments outside an allow-update window.
        const READ_ONLY = 1 << 1;
        /// Never convert the value into a dynamic container.
        const BLOCKED = 1 << 2;
    }
}

pub(crate) struct DynProperty {
    name: Key,
    core: Rc<HandlerCore>,
    value: RefCell<Value>,
    /// Whether the value is a container eligible for conversion; `None` until
    /// the first access classifies it.
    is_container: Cell<Option<bool>>,
    flags: Cell<PropertyFlags>,
    watchers: RefCell<Vec<Rc<Registration>>>,
}

impl DynProperty {
    pub(crate) fn new(core: &Rc<HandlerCore>, name: Key, value: Value) -> Rc<Self> {
        Rc::new(Self {
            name,
            core: Rc::clone(core),
            value: RefCell::new(value),
            is_container: Cell::new(None),
            flags: Cell::new(PropertyFlags::empty()),
            watchers: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn is_owned_by(&self, core: &Rc<HandlerCore>) -> bool {
        Rc::ptr_eq(&self.core, core)
    }

    pub(crate) fn add_flags(&self, flags: PropertyFlags) {
        self.flags.set(self.flags.get() | flags);
    }

    pub(crate) fn watchers(&self) -> Vec<Rc<Registration>> {
        self.watchers.borrow().clone()
    }

    /// Current value without tracking or lazy conversion.
    pub(crate) fn peek(&self) -> Value {
        self.value.borrow().clone()
    }

    fn can_make_dynamic(&self, value: &Value) -> bool {
        !self.flags.get().contains(PropertyFlags::BLOCKED)
            && value.container_ref().is_some_and(|node| !node.is_blocked())
    }

    fn classify(&self) -> bool {
        self.is_container
            .get()
            .unwrap_or_else(|| self.can_make_dynamic(&self.value.borrow()))
    }

    /// Tracked read.
    pub(crate) fn get(self: &Rc<Self>) -> Value {
        if self.is_container.get().is_none() {
            let value = self.peek();
            let is_container = self.can_make_dynamic(&value);
            if is_container {
                if let Some(node) = value.container_ref() {
                    if !node.is_dynamic() {
                        make_dynamic_object(&self.core, &node, &self.name.to_string(), "Converting");
                    }
                }
            }
            self.is_container.set(Some(is_container));
        }

        if let Some(active) = self.core.active_registration() {
            self.track(&active);
        }
        self.peek()
    }

    fn track(self: &Rc<Self>, registration: &Rc<Registration>) {
        if !registration.is_active() {
            return;
        }
        let mut watchers = self.watchers.borrow_mut();
        if !watchers.iter().any(|w| Rc::ptr_eq(w, registration)) {
            watchers.push(Rc::clone(registration));
        }
        drop(watchers);
        registration.record_read(self);
    }

    pub(crate) fn untrack(&self, registration: &Registration) {
        self.watchers
            .borrow_mut()
            .retain(|w| !std::ptr::eq(Rc::as_ptr(w), registration));
    }

    /// Tracked write. `owner` is the container holding this property, used
    /// for the read-only diagnostic.
    pub(crate) fn set(self: &Rc<Self>, owner: &ContainerRef, new_value: Value) -> Result<()> {
        let current = self.peek();
        if current == new_value {
            return Ok(());
        }

        if self.flags.get().contains(PropertyFlags::READ_ONLY) && !self.core.allow_update() {
            return Err(ConfigError::ReadOnly {
                name: self.name.to_string(),
                dump: owner.dump(),
            });
        }

        let mut new_value = new_value;
        let is_container = self.classify();
        let is_referenced = is_container && self.flags.get().contains(PropertyFlags::REFERENCED);

        if is_container {
            if let Some(node) = current.container_ref() {
                if is_referenced {
                    if self.absorb(&node, &new_value)? {
                        new_value = current.clone();
                    }
                } else if node.is_dynamic() {
                    // The container is being replaced: everything that read
                    // one of its properties must re-run.
                    for key in node.keys() {
                        if let Some(Slot::Tracked(prop)) = node.slot(&key) {
                            if prop.is_owned_by(&self.core) {
                                self.core.schedule(&prop);
                            }
                        }
                    }
                }
            }
        }

        if new_value != current {
            let new_is_container = self.can_make_dynamic(&new_value);
            if !is_referenced && new_is_container {
                if let Some(node) = new_value.container_ref() {
                    make_dynamic_object(&self.core, &node, &self.name.to_string(), "Converting");
                }
            }
            *self.value.borrow_mut() = new_value;
            self.is_container.set(Some(new_is_container));
        }

        self.core.schedule(self);
        Ok(())
    }

    /// Copy `source` into the referenced container `node`, keeping its
    /// identity. Existing keys missing from `source` become undefined.
    ///
    /// Returns `false` when the copy failed part way; the property then stops
    /// treating its value as a container.
    fn absorb(&self, node: &ContainerRef, source: &Value) -> Result<bool> {
        for key in node.keys() {
            let incoming = source.get(key.clone());
            if let Err(err) = node.write(&key, incoming) {
                if err.is_read_only() {
                    return Err(err);
                }
                self.core.report(
                    LoggingSeverity::Warning,
                    MessageId::DYNAMIC_CONFIG_EXCEPTION,
                    &ConfigError::conversion(key.to_string(), "Assigning", &err).to_string(),
                );
            }
        }

        for key in source.keys() {
            let incoming = source.get(key.clone());
            if let Err(err) = set_dynamic_property(&self.core, node, key.clone(), incoming) {
                self.core.report(
                    LoggingSeverity::Warning,
                    MessageId::DYNAMIC_CONFIG_EXCEPTION,
                    &ConfigError::conversion(self.name.to_string(), "Assigning", &err).to_string(),
                );
                self.is_container.set(Some(false));
                return Ok(false);
            }
        }
        Ok(true)
    }
}
