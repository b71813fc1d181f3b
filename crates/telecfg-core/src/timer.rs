#![forbid(unsafe_code)]

//! Single-threaded macrotask queue used for deferred change notification.
//!
//! A property write never runs watchers synchronously. It schedules a
//! zero-delay task here, and the host drains the queue once per turn of its
//! event loop with [`run_pending_timers`]. Tasks scheduled while a turn is
//! running are deferred to the next turn, which is what coalesces a burst of
//! writes into one flush.
//!
//! The queue is thread-local: every thread is its own event loop.
//!
//! # Invariants
//!
//! 1. Tasks run in scheduling order.
//! 2. A cancelled task never runs, even if it was cancelled during the turn
//!    that would have run it.
//! 3. [`run_pending_timers`] runs only tasks that were queued before the call.

use std::cell::RefCell;
use std::collections::VecDeque;

type Task = Box<dyn FnOnce()>;

#[derive(Default)]
struct TaskQueue {
    next_id: u64,
    tasks: VecDeque<(u64, Task)>,
}

thread_local! {
    static QUEUE: RefCell<TaskQueue> = RefCell::new(TaskQueue::default());
}

/// Handle to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutHandle {
    id: u64,
}

impl TimeoutHandle {
    /// Remove the task from the queue. Returns `false` if it already ran or
    /// was cancelled.
    pub fn cancel(&self) -> bool {
        QUEUE.with(|q| {
            let mut q = q.borrow_mut();
            match q.tasks.iter().position(|(id, _)| *id == self.id) {
                Some(idx) => {
                    q.tasks.remove(idx);
                    true
                }
                None => false,
            }
        })
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        QUEUE.with(|q| q.borrow().tasks.iter().any(|(id, _)| *id == self.id))
    }
}

/// Queue `task` for the next turn.
pub fn schedule_timeout(task: impl FnOnce() + 'static) -> TimeoutHandle {
    QUEUE.with(|q| {
        let mut q = q.borrow_mut();
        q.next_id += 1;
        let id = q.next_id;
        q.tasks.push_back((id, Box::new(task)));
        TimeoutHandle { id }
    })
}

/// Number of tasks waiting on this thread.
#[must_use]
pub fn pending_timers() -> usize {
    QUEUE.with(|q| q.borrow().tasks.len())
}

/// Run one turn: every task queued before this call, in order.
///
/// Returns the number of tasks that ran.
pub fn run_pending_timers() -> usize {
    let Some(last) = QUEUE.with(|q| q.borrow().tasks.back().map(|(id, _)| *id)) else {
        return 0;
    };

    let mut ran = 0;
    loop {
        // The borrow is released before the task runs so it may schedule or cancel.
        let next = QUEUE.with(|q| {
            let mut q = q.borrow_mut();
            match q.tasks.front() {
                Some((id, _)) if *id <= last => q.tasks.pop_front(),
                _ => None,
            }
        });
        let Some((_, task)) = next else {
            break;
        };
        task();
        ran += 1;
    }
    ran
}

/// Run turns until the queue is empty or `max_turns` turns have run.
///
/// Returns the total number of tasks that ran.
pub fn run_timers_until_idle(max_turns: usize) -> usize {
    let mut total = 0;
    for _ in 0..max_turns {
        let ran = run_pending_timers();
        if ran == 0 {
            break;
        }
        total += ran;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn tasks_run_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = Rc::clone(&log);
            schedule_timeout(move || log.borrow_mut().push(i));
        }
        assert_eq!(pending_timers(), 3);
        assert_eq!(run_pending_timers(), 3);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert_eq!(pending_timers(), 0);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let handle = schedule_timeout(move || flag.set(true));
        assert!(handle.is_pending());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(run_pending_timers(), 0);
        assert!(!ran.get());
    }

    #[test]
    fn tasks_scheduled_during_turn_wait_for_next_turn() {
        let count = Rc::new(Cell::new(0u32));
        let outer = Rc::clone(&count);
        schedule_timeout(move || {
            outer.set(outer.get() + 1);
            let inner = Rc::clone(&outer);
            schedule_timeout(move || inner.set(inner.get() + 10));
        });

        assert_eq!(run_pending_timers(), 1);
        assert_eq!(count.get(), 1);
        assert_eq!(run_pending_timers(), 1);
        assert_eq!(count.get(), 11);
    }

    #[test]
    fn task_can_cancel_a_later_task() {
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let victim = Rc::new(Cell::new(None));
        let victim_slot = Rc::clone(&victim);
        schedule_timeout(move || {
            if let Some(handle) = victim_slot.get() {
                let handle: TimeoutHandle = handle;
                handle.cancel();
            }
        });
        victim.set(Some(schedule_timeout(move || flag.set(true))));

        assert_eq!(run_pending_timers(), 1);
        assert!(!ran.get());
    }

    #[test]
    fn until_idle_respects_turn_limit() {
        fn reschedule(count: Rc<Cell<u32>>) {
            schedule_timeout(move || {
                count.set(count.get() + 1);
                reschedule(count);
            });
        }
        let count = Rc::new(Cell::new(0));
        reschedule(Rc::clone(&count));
        assert_eq!(run_timers_until_idle(5), 5);
        assert_eq!(count.get(), 5);
        assert_eq!(pending_timers(), 1);
    }
}
