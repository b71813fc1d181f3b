#![no_main]

use std::cell::Cell;
use std::rc::Rc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use telecfg_core::timer::run_timers_until_idle;
use telecfg_core::{ConfigList, ConfigMap, Value, create_dynamic_config};

const KEYS: [&str; 4] = ["a", "b", "c", "items"];

#[derive(Arbitrary, Debug)]
enum Leaf {
    Null,
    Bool(bool),
    Number(i16),
    Text(u8),
    Map(Vec<(u8, i16)>),
    List(Vec<i16>),
}

impl Leaf {
    fn to_value(&self) -> Value {
        match self {
            Leaf::Null => Value::Null,
            Leaf::Bool(b) => Value::from(*b),
            Leaf::Number(n) => Value::from(f64::from(*n)),
            Leaf::Text(t) => Value::from(format!("s{t}")),
            Leaf::Map(entries) => Value::from(ConfigMap::from_entries(
                entries
                    .iter()
                    .take(8)
                    .map(|(k, v)| (KEYS[usize::from(*k) % KEYS.len()], Value::from(f64::from(*v)))),
            )),
            Leaf::List(items) => Value::from(ConfigList::from_values(
                items.iter().take(8).map(|v| Value::from(f64::from(*v))),
            )),
        }
    }
}

#[derive(Arbitrary, Debug)]
enum Op {
    Set { key: u8, value: Leaf },
    SetNested { key: u8, inner: u8, value: Leaf },
    Remove { key: u8 },
    ReadOnly { key: u8 },
    Reference { key: u8 },
    Push(i16),
    Shift,
    Splice { start: u8, count: u8 },
    Watch { key: u8, write_back: bool },
    Notify,
    Turn,
}

fn key(k: u8) -> &'static str {
    KEYS[usize::from(k) % KEYS.len()]
}

fuzz_target!(|ops: Vec<Op>| {
    let root = ConfigMap::new()
        .with("a", 1.0)
        .with("b", ConfigMap::new().with("a", 2.0))
        .with("items", ConfigList::from_values([Value::from(1.0)]));
    let handler = create_dynamic_config(Value::from(root), None);
    let runs = Rc::new(Cell::new(0u64));

    for op in ops.iter().take(256) {
        let cfg = handler.cfg();
        match op {
            Op::Set { key: k, value } => {
                let _ = cfg.set(key(*k), value.to_value());
            }
            Op::SetNested { key: k, inner, value } => {
                let _ = cfg.get(key(*k)).set(key(*inner), value.to_value());
            }
            Op::Remove { key: k } => {
                let _ = cfg.remove(key(*k));
            }
            Op::ReadOnly { key: k } => {
                handler.rd_only(cfg, key(*k));
            }
            Op::Reference { key: k } => {
                handler.reference(cfg, key(*k));
            }
            Op::Push(v) => {
                if let Some(list) = cfg.get("items").as_list() {
                    let _ = list.push(f64::from(*v));
                }
            }
            Op::Shift => {
                if let Some(list) = cfg.get("items").as_list() {
                    let _ = list.shift();
                }
            }
            Op::Splice { start, count } => {
                if let Some(list) = cfg.get("items").as_list() {
                    let _ = list.splice(usize::from(*start % 8), usize::from(*count % 4), std::iter::empty());
                }
            }
            Op::Watch { key: k, write_back } => {
                let name = key(*k);
                let write_back = *write_back;
                let counter = Rc::clone(&runs);
                let _ = handler.watch(move |d| {
                    counter.set(counter.get() + 1);
                    let seen = d.cfg().get(name);
                    if write_back {
                        d.cfg().set("c", seen)?;
                    }
                    Ok(())
                });
            }
            Op::Notify => handler.notify(),
            Op::Turn => {
                run_timers_until_idle(4);
            }
        }
    }

    handler.notify();
    assert!(!handler.has_pending());
    let _ = handler.cfg().to_json();
});
