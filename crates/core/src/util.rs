use std::fmt;
use std::time::{Duration, Instant};

/// Humanize a byte count for log lines.
pub fn pretty_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} B")
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Retry `op` with capped exponential backoff. Used for transient storage
/// failures; anything still failing after `attempts` tries surfaces the last
/// error.
pub fn retry_with_backoff<T, E: fmt::Display>(
    what: &str,
    attempts: u32,
    base_delay: Duration,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    const MAX_DELAY: Duration = Duration::from_secs(5);
    let mut delay = base_delay;
    let mut tries = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                tries += 1;
                if tries >= attempts {
                    return Err(e);
                }
                log::warn!("{what} failed (attempt {tries}/{attempts}), retrying: {e}");
                std::thread::sleep(delay);
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

/// Accumulates named events and logs the time between them.
pub struct Tracer {
    start: Instant,
    events: Vec<(Instant, &'static str)>,
}

impl Tracer {
    pub fn new() -> Self {
        Tracer {
            start: Instant::now(),
            events: Vec::new(),
        }
    }

    pub fn log(&mut self, event: &'static str) {
        self.events.push((Instant::now(), event));
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut prev = self.start;
        for (at, event) in &self.events {
            write!(f, "{}: {:.3}s ", event, at.duration_since(prev).as_secs_f64())?;
            prev = *at;
        }
        match self.events.last() {
            Some((end, _)) => write!(f, "total: {:.3}s", end.duration_since(self.start).as_secs_f64()),
            None => write!(f, "total: 0.000s"),
        }
    }
}
