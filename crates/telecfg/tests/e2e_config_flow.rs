#![forbid(unsafe_code)]

//! End-to-end: the diagnostic logger and the throttle manager share one live
//! config, and a single batched flush reconfigures both.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use telecfg::prelude::*;
use telecfg::throttle::{Clock, MemoryStorage, RandomSource};

struct FixedClock(DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

struct AlwaysSampled;

impl RandomSource for AlwaysSampled {
    fn random_up_to(&self, _max: u32) -> u32 {
        0
    }
}

fn shared_config() -> Value {
    Value::from(json!({
        "instrumentationKey": "ikey-1",
        "maxMessageLimit": 10,
        "throttleMgrCfg": {
            "109": {"limit": {"maxSendNumber": 1}, "interval": {"dayInterval": 1}}
        }
    }))
}

#[test]
fn logger_and_throttle_share_one_config() {
    let config = shared_config();
    let diag = DiagnosticLogger::new(config.clone());
    let mgr = ThrottleMgr::builder(config.clone())
        .logger(diag.clone())
        .storage(Rc::new(MemoryStorage::new()))
        .clock(Rc::new(FixedClock(Utc.with_ymd_and_hms(2024, 9, 9, 12, 0, 0).unwrap())))
        .random(Rc::new(AlwaysSampled))
        .build();
    mgr.on_ready_state(None, false);

    let handler = get_dynamic_config_handler(&config).expect("config is dynamic");
    assert!(handler.ptr_eq(mgr.handler()));
    assert_eq!(config.get("loggingLevelTelemetry"), Value::from(1));

    let sent = mgr.send_message(MessageId(50), "first", None).unwrap();
    assert!(sent.is_throttled);
    assert_eq!(diag.queue().len(), 1);
    assert_eq!(diag.queue()[0].id, MessageId(50));

    // One batch of edits, one flush on the next task-queue turn.
    config.set("loggingLevelTelemetry", 0).unwrap();
    config
        .set("throttleMgrCfg", Value::from(json!({"109": {"disabled": true}})))
        .unwrap();
    assert!(handler.has_pending());
    assert_eq!(run_pending_timers(), 1);
    assert!(!handler.has_pending());

    assert_eq!(diag.telemetry_logging_level(), LoggingSeverity::Disabled);
    assert!(mgr.config(MessageId(50)).disabled);
    let sent = mgr.send_message(MessageId(51), "second", None).unwrap();
    assert!(!sent.is_throttled);
    assert_eq!(diag.queue().len(), 1);
}

#[test]
fn component_defaults_and_read_only_settings() {
    let config = shared_config();
    let handler = ConfigHandler::builder(config.clone())
        .defaults(
            ConfigDefaults::new()
                .with("instrumentationKey", df::read_only(""))
                .with("endpointUrl", df::string("https://telemetry.invalid/v2/track"))
                .with(
                    "extensionConfig",
                    ConfigDefaults::new().with("sampling", DefaultCheck::new().value(100)),
                ),
        )
        .build();

    assert_eq!(config.get("instrumentationKey"), Value::from("ikey-1"));
    assert_eq!(
        config.get("endpointUrl"),
        Value::from("https://telemetry.invalid/v2/track")
    );
    assert_eq!(config.get("extensionConfig").get("sampling"), Value::from(100));

    let err = config.set("instrumentationKey", "other").unwrap_err();
    assert!(matches!(err, ConfigError::ReadOnly { .. }));

    let seen = Rc::new(RefCell::new(Vec::new()));
    let runs = Rc::new(Cell::new(0));
    let (sink, count) = (Rc::clone(&seen), Rc::clone(&runs));
    let _guard = handler
        .watch(move |details| {
            count.set(count.get() + 1);
            sink.borrow_mut()
                .push(details.cfg().get("extensionConfig").get("sampling"));
            Ok(())
        })
        .into_guard();

    config.get("extensionConfig").set("sampling", 25).unwrap();
    run_timers_until_idle(4);
    assert_eq!(runs.get(), 2);
    assert_eq!(*seen.borrow(), vec![Value::from(100), Value::from(25)]);
}

#[test]
fn on_config_change_converts_plain_config_with_logger() {
    let diag = DiagnosticLogger::new(Value::from(json!({"loggingLevelConsole": 2})));
    let plain = Value::from(json!({"enabled": true}));
    let logger: Rc<dyn InternalLogger> = diag.clone();

    let enabled = Rc::new(Cell::new(false));
    let sink = Rc::clone(&enabled);
    let handle = on_config_change(
        &plain,
        move |details| {
            sink.set(details.cfg().get("enabled").truthy());
            Ok(())
        },
        Some(logger),
    )
    .expect("logger given");
    assert!(enabled.get());
    assert!(get_dynamic_config_handler(&plain).is_some());

    plain.set("enabled", false).unwrap();
    run_pending_timers();
    assert!(!enabled.get());

    handle.rm();
    plain.set("enabled", true).unwrap();
    run_pending_timers();
    assert!(!enabled.get());
}
