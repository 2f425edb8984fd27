//! Structured logging with timestamps, source locations, and ANSI colour support.
//!
//! Provides the [`rlog!`] macro for consistent log output in the format:
//!
//! ```text
//! 20260211T21:33:12.000 - src/relay.rs:42 - relay: chunk 3/8 stored for f-a1b2c3d
//! ```
//!
//! When writing to a terminal, output is colour-coded:
//! - Timestamps and source locations are dimmed
//! - Session, file and peer ids get consistent colours based on their content
//!
//! By default log lines go to stderr.  Call [`set_writer`] to redirect output
//! to any [`std::io::Write`] implementor (file, in-memory buffer, etc.).
//! Installing a custom writer also disables ANSI colour codes.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize the logging system. Call once at startup before any logging.
/// Detects whether stderr supports ANSI colours.
pub fn init() {
    let is_terminal = std::io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);
}

/// Replace the log writer.  All subsequent [`rlog!`] output goes to `w`.
/// Also disables ANSI colour codes.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    let mut writer = LOG_WRITER.lock().unwrap_or_else(|e| e.into_inner());
    *writer = w;
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

const ID_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
    "\x1b[31m", // red
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[34m", // blue
    "\x1b[35m", // magenta
    "\x1b[36m", // cyan
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 7;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn tagged_id(prefix: &str, id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        let colour = hash_colour(id);
        format!("{colour}{prefix}-{short}{RESET}")
    } else {
        format!("{prefix}-{short}")
    }
}

/// Format a peer ID with consistent colour and truncation, e.g. `p-alice01`.
pub fn peer_id(id: &str) -> String {
    tagged_id("p", id)
}

/// Format a file ID, e.g. `f-a1b2c3d`.
pub fn file_id(id: &str) -> String {
    tagged_id("f", id)
}

/// Format a relay session ID.
///
/// Session ids share the `session_<ms>_` prefix, so the random tail is what
/// tells them apart in a log.
pub fn session_id(id: &str) -> String {
    let tail = id.rsplit('_').next().unwrap_or(id);
    tagged_id("s", tail)
}

struct CivilTime {
    year: i64,
    month: u64,
    day: u64,
    hours: u64,
    minutes: u64,
    seconds: u64,
    millis: u32,
}

fn civil_time(at: SystemTime) -> CivilTime {
    let duration = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    CivilTime {
        year: y,
        month: m,
        day: d,
        hours,
        minutes,
        seconds,
        millis,
    }
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let t = civil_time(SystemTime::now());
    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        t.year, t.month, t.day, t.hours, t.minutes, t.seconds, t.millis
    )
}

/// Format `at` as RFC 3339 UTC with millisecond precision,
/// e.g. `2026-02-11T21:33:12.000Z`.
pub fn iso_timestamp(at: SystemTime) -> String {
    let t = civil_time(at);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        t.year, t.month, t.day, t.hours, t.minutes, t.seconds, t.millis
    )
}

/// Write a single log line to the current writer.
///
/// Called by the [`rlog!`] macro; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap_or_else(|e| e.into_inner());
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line to the current writer with timestamp and source location.
///
/// # Usage
///
/// ```ignore
/// rlog!("relay: session started {}", logging::session_id(&sid));
/// rlog!("queue[upload]: {} task(s) aborted", count);
/// ```
#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn iso_timestamp_formats_epoch_offsets() {
        assert_eq!(iso_timestamp(UNIX_EPOCH), "1970-01-01T00:00:00.000Z");
        let at = UNIX_EPOCH + Duration::from_millis(1_770_845_592_123);
        assert_eq!(iso_timestamp(at), "2026-02-11T21:33:12.123Z");
    }

    #[test]
    fn session_ids_are_shortened_to_their_random_tail() {
        let formatted = session_id("session_1700000000000_AbCdEfGhIjK");
        assert!(formatted.ends_with("s-AbCdEfG") || formatted.contains("s-AbCdEfG"));
    }

    #[test]
    fn ids_are_truncated() {
        assert!(file_id("0123456789abcdef").contains("f-0123456"));
    }
}
