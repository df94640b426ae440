//! User idle time.

use std::process::Command;
use std::sync::Arc;

use ledger_core::IdleProbe;
use once_cell::sync::Lazy;
use regex::Regex;

static HID_IDLE_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""HIDIdleTime" = (\d+)"#).expect("valid regex"));

/// Reads `HIDIdleTime` (nanoseconds) from `ioreg -c IOHIDSystem`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoregIdleProbe;

impl IdleProbe for IoregIdleProbe {
    fn sample_idle_seconds(&self) -> i64 {
        match Command::new("ioreg").args(["-c", "IOHIDSystem"]).output() {
            Ok(output) => parse_hid_idle_seconds(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                tracing::debug!("ioreg failed: {}", e);
                -1
            }
        }
    }
}

/// Platforms without an idle source.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdleProbe;

impl IdleProbe for NoIdleProbe {
    fn sample_idle_seconds(&self) -> i64 {
        -1
    }
}

/// First `HIDIdleTime` in `ioreg` output, in whole seconds; -1 if absent.
pub fn parse_hid_idle_seconds(output: &str) -> i64 {
    HID_IDLE_TIME
        .captures(output)
        .and_then(|c| c[1].parse::<i64>().ok())
        .map(|ns| ns / 1_000_000_000)
        .unwrap_or(-1)
}

/// The idle probe for the current platform.
pub fn platform_probe() -> Arc<dyn IdleProbe> {
    if cfg!(target_os = "macos") {
        Arc::new(IoregIdleProbe)
    } else {
        Arc::new(NoIdleProbe)
    }
}
