//! Process-wide leveled logging to stderr.
//!
//! Lines are written as text (`<ts> LEVEL target: msg`) or one JSON object
//! per line. A bounded in-memory capture can be switched on so tests and
//! status endpoints can inspect recent lines.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);

#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub msg: String,
}

static CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);
static CAPTURE_CAPACITY: AtomicUsize = AtomicUsize::new(0);
static CAPTURE: OnceLock<Mutex<VecDeque<CapturedLog>>> = OnceLock::new();

pub fn init(config: LogConfig) {
    LOG_LEVEL.store(config.level as u8, Ordering::Relaxed);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Keep the most recent `capacity` lines in memory. Zero turns capture off.
pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        CAPTURE_ENABLED.store(false, Ordering::Relaxed);
        return;
    }
    CAPTURE_CAPACITY.store(capacity, Ordering::Relaxed);
    CAPTURE.get_or_init(|| Mutex::new(VecDeque::with_capacity(capacity.min(1024))));
    CAPTURE_ENABLED.store(true, Ordering::Relaxed);
}

pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    let Some(buf) = CAPTURE.get() else {
        return Vec::new();
    };
    let Ok(guard) = buf.lock() else {
        return Vec::new();
    };
    let start = guard.len().saturating_sub(limit);
    guard.iter().skip(start).cloned().collect()
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ts_ms: u64 = now.as_millis().try_into().unwrap_or(u64::MAX);
    let capture = CAPTURE_ENABLED.load(Ordering::Relaxed);
    let format = match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => Format::Json,
        _ => Format::Text,
    };

    let mut out = io::stderr().lock();
    let _ = match format {
        Format::Text => write_text(&mut out, now, level, target, args),
        Format::Json => {
            let record = json!({
                "ts_ms": ts_ms,
                "level": level.as_str(),
                "target": target,
                "file": file,
                "line": line,
                "msg": args.to_string(),
            });
            writeln!(out, "{record}")
        }
    };

    if capture {
        push_captured(CapturedLog {
            ts_ms,
            level,
            target,
            msg: args.to_string(),
        });
    }
}

fn write_text(
    out: &mut impl Write,
    now: Duration,
    level: Level,
    target: &str,
    args: fmt::Arguments<'_>,
) -> io::Result<()> {
    if LOG_TIMESTAMPS.load(Ordering::Relaxed) {
        write!(out, "{} ", Timestamp(now))?;
    }
    writeln!(out, "{} {}: {}", level.as_str(), target, args)
}

fn push_captured(entry: CapturedLog) {
    let Some(buf) = CAPTURE.get() else {
        return;
    };
    let Ok(mut guard) = buf.lock() else {
        return;
    };
    let cap = CAPTURE_CAPACITY.load(Ordering::Relaxed).max(1);
    guard.push_back(entry);
    while guard.len() > cap {
        guard.pop_front();
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

/// UTC wall-clock time since the unix epoch, printed as RFC 3339 with millis.
struct Timestamp(Duration);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SECS_PER_DAY: u64 = 86_400;
        let secs = self.0.as_secs();
        let (year, month, day) = civil_from_days((secs / SECS_PER_DAY) as i64);
        let secs_of_day = secs % SECS_PER_DAY;
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            secs_of_day / 3600,
            (secs_of_day % 3600) / 60,
            secs_of_day % 60,
            self.0.subsec_millis()
        )
    }
}

// Howard Hinnant's days-to-civil conversion.
fn civil_from_days(days_since_unix_epoch: i64) -> (i32, u32, u32) {
    let z = days_since_unix_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe as i32) + (era as i32) * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (y + i32::from(m <= 2), m, d)
}
