#![forbid(unsafe_code)]

//! Watcher registrations and deferred change notification.
//!
//! # Design
//!
//! Every handler core owns one [`NotifyQueue`]. A tracked write queues the
//! registrations that read the written property and, if nothing is pending
//! yet, schedules one zero-delay timer. When the timer fires (or
//! [`ConfigHandler::notify`](crate::ConfigHandler::notify) is called) the
//! queue is drained in passes: each pass clears the read-set of every queued
//! watcher and re-runs it, which rebuilds its dependencies from scratch.
//! Writes made by watchers land in the next pass.
//!
//! # Invariants
//!
//! 1. A registration is queued at most once per pass.
//! 2. At most one timer is pending per handler.
//! 3. A removed watcher never runs again, even if it was already queued.
//! 4. The active registration is restored when a callback returns, including
//!    on early return from an error.
//!
//! # Failure Modes
//!
//! - **Watcher error**: an `Err` is logged as critical and swallowed; remaining
//!   watchers in the pass still run.
//! - **Watcher panic**: not caught. It unwinds out of `notify()` and the rest of
//!   the drained batch is lost; watchers still queued behind it do not run
//!   until one of their properties changes again.
//! - **Runaway flush**: watchers that keep invalidating each other are cut off
//!   after [`MAX_NOTIFY_PASSES`]; the still-queued watchers are dropped and a
//!   critical diagnostic is logged.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::handler::{ConfigHandler, HandlerCore, WatchDetails};
use crate::logger::{LoggingSeverity, MessageId};
use crate::property::DynProperty;
use crate::timer::{self, TimeoutHandle};

/// Upper bound on re-run passes within one notification.
pub const MAX_NOTIFY_PASSES: usize = 100;

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Watcher callback. Returning an error only logs it.
pub type WatcherFn = Rc<dyn Fn(&WatchDetails<'_>) -> Result<()>>;

// ─── Registration ────────────────────────────────────────────────────────────

pub(crate) struct Registration {
    id: u64,
    func: RefCell<Option<WatcherFn>>,
    read_set: RefCell<Vec<Weak<DynProperty>>>,
}

impl Registration {
    fn new(func: WatcherFn) -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed),
            func: RefCell::new(Some(func)),
            read_set: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.func.borrow().is_some()
    }

    fn callback(&self) -> Option<WatcherFn> {
        self.func.borrow().clone()
    }

    pub(crate) fn record_read(&self, prop: &Rc<DynProperty>) {
        let mut read_set = self.read_set.borrow_mut();
        let ptr = Rc::as_ptr(prop);
        if !read_set.iter().any(|w| w.as_ptr() == ptr) {
            read_set.push(Rc::downgrade(prop));
        }
    }

    /// Detach from every property in the read-set.
    fn clear_tracking(&self) {
        let read_set = std::mem::take(&mut *self.read_set.borrow_mut());
        for prop in read_set.iter().filter_map(Weak::upgrade) {
            prop.untrack(self);
        }
    }

    fn remove(&self) {
        self.func.borrow_mut().take();
        self.clear_tracking();
    }

    fn read_count(&self) -> usize {
        self.read_set
            .borrow()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

// ─── Watch handles ───────────────────────────────────────────────────────────

/// Handle returned by `watch`. Dropping it leaves the watcher installed; call
/// [`rm`](Self::rm) or convert it into a [`WatchGuard`] to remove it.
pub struct WatchHandle {
    registration: Rc<Registration>,
}

impl WatchHandle {
    /// Remove the watcher. Idempotent.
    pub fn rm(&self) {
        self.registration.remove();
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.registration.is_active()
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.registration.id
    }

    /// Number of properties the watcher currently depends on.
    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.registration.read_count()
    }

    /// Tie the watcher's lifetime to the returned guard.
    #[must_use]
    pub fn into_guard(self) -> WatchGuard {
        WatchGuard { handle: self }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.registration.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WatcherHandler")?;
        if !self.is_active() {
            write!(f, " (removed)")?;
        }
        Ok(())
    }
}

/// Removes its watcher when dropped.
#[must_use = "dropping the guard removes the watcher"]
#[derive(Debug)]
pub struct WatchGuard {
    handle: WatchHandle,
}

impl WatchGuard {
    #[must_use]
    pub fn handle(&self) -> &WatchHandle {
        &self.handle
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.handle.rm();
    }
}

// ─── Notify queue ────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct NotifyQueue {
    waiting: RefCell<Vec<Rc<Registration>>>,
    timer: Cell<Option<TimeoutHandle>>,
    active: RefCell<Option<Rc<Registration>>>,
}

/// Restores the previously active registration on drop.
struct ActiveScope<'a> {
    queue: &'a NotifyQueue,
    prev: Option<Rc<Registration>>,
}

impl<'a> ActiveScope<'a> {
    fn enter(queue: &'a NotifyQueue, registration: Option<Rc<Registration>>) -> Self {
        let prev = queue.active.replace(registration);
        Self { queue, prev }
    }
}

impl Drop for ActiveScope<'_> {
    fn drop(&mut self) {
        *self.queue.active.borrow_mut() = self.prev.take();
    }
}

impl HandlerCore {
    pub(crate) fn active_registration(&self) -> Option<Rc<Registration>> {
        self.queue.active.borrow().clone()
    }

    /// Queue every watcher of `prop` and arm the timer if needed.
    pub(crate) fn schedule(self: &Rc<Self>, prop: &Rc<DynProperty>) {
        let watchers = prop.watchers();
        if watchers.is_empty() {
            return;
        }

        if self.queue.timer.get().is_none() {
            let core = Rc::downgrade(self);
            let handle = timer::schedule_timeout(move || {
                if let Some(core) = core.upgrade() {
                    core.queue.timer.set(None);
                    core.notify();
                }
            });
            self.queue.timer.set(Some(handle));
        }

        let mut waiting = self.queue.waiting.borrow_mut();
        for registration in watchers {
            if !waiting.iter().any(|w| Rc::ptr_eq(w, &registration)) {
                waiting.push(registration);
            }
        }
    }

    /// Drain the queue now, re-running watchers until it stays empty.
    pub(crate) fn notify(self: &Rc<Self>) {
        let mut passes = 0;
        loop {
            let batch = std::mem::take(&mut *self.queue.waiting.borrow_mut());
            if let Some(handle) = self.queue.timer.take() {
                handle.cancel();
            }
            if batch.is_empty() {
                break;
            }
            if passes == MAX_NOTIFY_PASSES {
                self.report(
                    LoggingSeverity::Critical,
                    MessageId::CONFIG_WATCHER_LOOP,
                    &format!(
                        "Config watchers still changing after {MAX_NOTIFY_PASSES} passes, dropping {} pending",
                        batch.len()
                    ),
                );
                break;
            }
            passes += 1;
            tracing::trace!(uid = %self.uid(), pass = passes, watchers = batch.len(), "config.notify");

            for registration in batch {
                registration.clear_tracking();
                if let Some(func) = registration.callback() {
                    self.run_watcher(Some(Rc::clone(&registration)), &func);
                }
            }
        }
    }

    /// Run `f` with `registration` as the active watcher.
    pub(crate) fn with_active<R>(
        &self,
        registration: Option<Rc<Registration>>,
        f: impl FnOnce() -> R,
    ) -> R {
        let _scope = ActiveScope::enter(&self.queue, registration);
        f()
    }

    fn run_watcher(self: &Rc<Self>, registration: Option<Rc<Registration>>, func: &WatcherFn) {
        let Some(handler) = ConfigHandler::from_core(self) else {
            return;
        };
        let id = registration.as_ref().map_or(0, |r| r.id);
        let result = self.with_active(registration, || func(&WatchDetails::new(&handler)));
        if let Err(err) = result {
            self.report(
                LoggingSeverity::Critical,
                MessageId::CONFIG_WATCHER_EXCEPTION,
                &format!("Watcher [{id}] failed: {err}"),
            );
        }
    }

    /// Register `func` and run it once immediately to collect its reads.
    pub(crate) fn watch(self: &Rc<Self>, func: WatcherFn) -> WatchHandle {
        let registration = Registration::new(Rc::clone(&func));
        self.run_watcher(Some(Rc::clone(&registration)), &func);
        WatchHandle { registration }
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.queue.waiting.borrow().is_empty()
    }
}
