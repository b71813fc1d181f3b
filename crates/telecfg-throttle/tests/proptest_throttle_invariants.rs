#![forbid(unsafe_code)]

//! Property-based tests for throttle interval math and trigger accounting.
//!
//! 1. `check_interval` hits exactly the multiples of the interval.
//! 2. Over any run of days a message triggers at most once per day, and the
//!    copies sent never exceed `maxSendNumber` per trigger.

use std::cell::Cell;
use std::rc::Rc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;
use telecfg_core::{MemoryLogger, MessageId, Value};
use telecfg_throttle::{Clock, MemoryStorage, RandomSource, ThrottleMgr, check_interval};

// ── Strategies ──────────────────────────────────────────────────────────

/// Per day: how many messages are offered and the sampling draw.
fn days() -> impl Strategy<Value = Vec<(u8, u32)>> {
    proptest::collection::vec((0u8..5, 0u32..300), 1..40)
}

// ── Helpers ─────────────────────────────────────────────────────────────

struct StepClock(Cell<DateTime<Utc>>);

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        self.0.get()
    }
}

struct StepRandom(Cell<u32>);

impl RandomSource for StepRandom {
    fn random_up_to(&self, max: u32) -> u32 {
        self.0.get().min(max)
    }
}

// ── Properties ──────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn check_interval_hits_multiples(interval in 1i64..60, start in -100i64..100, offset in 0i64..500) {
        let current = start + offset;
        let step = check_interval(interval, start, current);
        if offset % interval == 0 {
            prop_assert_eq!(step, offset / interval + 1);
        } else {
            prop_assert_eq!(step, -1);
        }
    }

    #[test]
    fn check_interval_rejects_before_start(interval in 1i64..60, start in -100i64..100, back in 1i64..500) {
        prop_assert_eq!(check_interval(interval, start, start - back), -1);
    }

    #[test]
    fn non_positive_interval_always_passes(interval in -10i64..=0, start in -100i64..100, current in -100i64..100) {
        prop_assert_eq!(check_interval(interval, start, current), 1);
    }

    #[test]
    fn at_most_one_trigger_per_day(plan in days(), max_send in 1u32..4) {
        let clock = Rc::new(StepClock(Cell::new(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap())));
        let random = Rc::new(StepRandom(Cell::new(0)));
        let logger = Rc::new(MemoryLogger::new());
        let mgr = ThrottleMgr::builder(Value::from(json!({
            "throttleMgrCfg": {"7": {
                "limit": {"samplingRate": 150, "maxSendNumber": max_send},
                "interval": {"dayInterval": 1}
            }}
        })))
        .clock(clock.clone())
        .random(random.clone())
        .storage(Rc::new(MemoryStorage::new()))
        .logger(logger.clone())
        .build();
        mgr.on_ready_state(None, false);

        let id = MessageId(7);
        for (offered, draw) in &plan {
            random.0.set(*draw);
            let mut triggers = 0;
            for _ in 0..*offered {
                let result = mgr.send_message(id, "m", None).unwrap();
                prop_assert!(result.throttle_num <= max_send);
                if result.is_throttled {
                    triggers += 1;
                }
            }
            prop_assert!(triggers <= 1);
            clock.0.set(clock.0.get() + Duration::days(1));
        }

        let offered: u32 = plan.iter().map(|(n, _)| u32::from(*n)).sum();
        let sent = u32::try_from(logger.with_id(id).len()).unwrap();
        prop_assert!(sent <= offered);
    }
}
