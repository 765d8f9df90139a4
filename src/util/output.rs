#![allow(clippy::print_stdout)]

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Results of an action, printed as one JSON object with `--json`.
static JSON_OUTPUT: Mutex<BTreeMap<String, Value>> = Mutex::new(BTreeMap::new());
/// Plain text output is suppressed when JSON was asked for.
static SHOULD_PRINT_OUTPUT: AtomicBool = AtomicBool::new(true);

fn json_output() -> MutexGuard<'static, BTreeMap<String, Value>> {
    JSON_OUTPUT.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn set_should_print_output(should_print: bool) {
    SHOULD_PRINT_OUTPUT.store(should_print, Ordering::Relaxed);
}

pub fn print_output(printed_output: &str) {
    if SHOULD_PRINT_OUTPUT.load(Ordering::Relaxed) {
        println!("{}", printed_output);
    }
}

pub fn set_json_output(key: &str, value: &Value) {
    json_output().insert(key.to_string(), value.clone());
}

#[macro_export]
macro_rules! outln {
    ( $fmt:expr $(, $args:expr)*) => {
        $crate::util::print_output(&format!($fmt $(, $args)*))
    };
}

fn render_json_output() -> Result<String> {
    let map: serde_json::Map<String, Value> = json_output()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::to_string_pretty(&Value::Object(map))
        .context("Error serializing JSON")
}

pub fn print_json_output() -> Result<()> {
    println!("{}", render_json_output()?);
    Ok(())
}
