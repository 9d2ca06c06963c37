//! Console logging for the init process.
//!
//! Output goes to stdout (the serial console) without colours. Each line is
//! stamped with seconds since kernel boot, matching the kernel's own `dmesg`
//! timestamps so init and kernel messages interleave readably.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

const UPTIME_PATH: &str = "/proc/uptime";

/// Timer that reports time elapsed since boot.
pub struct BootClock {
    booted: Instant,
}

impl BootClock {
    /// Clock for a system that has been up for `uptime` as of now.
    pub fn from_uptime(uptime: Duration) -> Self {
        let now = Instant::now();
        Self {
            booted: now.checked_sub(uptime).unwrap_or(now),
        }
    }

    /// Read the current uptime from procfs. Falls back to counting from now
    /// when procfs is not mounted yet.
    pub fn from_proc() -> Self {
        let uptime = std::fs::read_to_string(UPTIME_PATH)
            .ok()
            .and_then(|text| parse_uptime(&text))
            .unwrap_or_default();
        Self::from_uptime(uptime)
    }

    pub fn since_boot(&self) -> Duration {
        self.booted.elapsed()
    }
}

impl FormatTime for BootClock {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "[ {:.6} ]", self.since_boot().as_secs_f64())
    }
}

/// First field of `/proc/uptime`: seconds since boot as a decimal.
pub fn parse_uptime(text: &str) -> Option<Duration> {
    let seconds: f64 = text.split_whitespace().next()?.parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// Install the global subscriber. Call once, after `/proc` is mounted.
pub fn init(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let result = tracing_subscriber::fmt()
        .with_timer(BootClock::from_proc())
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false)
        .with_writer(std::io::stdout)
        .try_init();
    if let Err(e) = result {
        eprintln!("[guest-init] logging already initialised: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_uptime_line() {
        let uptime = parse_uptime("12.50 40.12\n").unwrap();
        assert_eq!(uptime, Duration::from_millis(12_500));
    }

    #[test]
    fn rejects_garbage_uptime() {
        assert_eq!(parse_uptime(""), None);
        assert_eq!(parse_uptime("abc 1.0"), None);
        assert_eq!(parse_uptime("-3.0 1.0"), None);
    }

    #[test]
    fn clock_counts_from_boot() {
        let clock = BootClock::from_uptime(Duration::from_secs(30));
        let elapsed = clock.since_boot();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(60));
    }

    #[test]
    fn formats_with_microsecond_precision() {
        let clock = BootClock::from_uptime(Duration::from_secs(5));
        let mut out = String::new();
        clock.format_time(&mut Writer::new(&mut out)).unwrap();
        assert!(out.starts_with("[ 5."), "{out}");
        assert!(out.ends_with(" ]"));
        let digits = out.trim_start_matches("[ ").trim_end_matches(" ]");
        assert_eq!(digits.split('.').nth(1).unwrap().len(), 6);
    }
}
