//! Timing for logged operations.

use std::time::Instant;

/// Measures how long a named operation took.
#[derive(Debug)]
pub struct OperationTimer {
    start: Instant,
    name: &'static str,
}

impl OperationTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the operation name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_measures() {
        let timer = OperationTimer::start("load");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5.0);
        assert_eq!(timer.name(), "load");
    }
}
