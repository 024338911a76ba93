//! Helpers shared by the command-line subcommands.

use anyhow::{bail, Result};
use serde_json::Value;

/// Process exit status when a scan finds blocking threats.
pub const EXIT_UNSAFE: i32 = 2;

/// Process exit status when an execution fails.
pub const EXIT_FAILED: i32 = 1;

/// Parses `name=value`. The value is JSON when it parses as JSON and a plain
/// string otherwise, so `x=21` is a number and `symbol=BTC` a string.
pub fn parse_param(raw: &str) -> Result<(String, Value)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("parameter `{raw}` must look like name=value");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("parameter `{raw}` has an empty name");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}
