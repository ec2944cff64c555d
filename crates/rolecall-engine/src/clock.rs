//! Call duration, derived from a monotonic start instant.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CallClock {
    started: Option<Instant>,
}

impl CallClock {
    /// Start counting, unless already running.
    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        self.started = None;
    }

    pub fn started(&self) -> Option<Instant> {
        self.started
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|s| s.elapsed())
    }
}

/// `mm:ss`, with minutes running past 59 for long calls.
pub fn format_call_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        assert_eq!(format_call_duration(Duration::from_secs(0)), "00:00");
        assert_eq!(format_call_duration(Duration::from_millis(65_900)), "01:05");
        assert_eq!(format_call_duration(Duration::from_secs(3_725)), "62:05");
    }

    #[tokio::test]
    async fn test_clock_runs_from_first_start() {
        let mut clock = CallClock::default();
        assert_eq!(clock.elapsed(), None);

        clock.start();
        let first = clock.started();
        tokio::time::sleep(Duration::from_millis(20)).await;
        clock.start();
        assert_eq!(clock.started(), first);
        assert!(clock.elapsed().unwrap() >= Duration::from_millis(20));

        clock.stop();
        assert_eq!(clock.elapsed(), None);
    }
}
