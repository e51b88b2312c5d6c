//! Gesprächsdauer
//!
//! Die Dauer wird immer aus der Differenz zur Startzeit berechnet, nicht
//! durch Hochzählen pro Tick; ein ausgelasteter Scheduler verfälscht sie so
//! nicht. Verwendet `tokio::time::Instant`, damit Tests mit pausierter Uhr
//! arbeiten können.

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallTimer {
    epoch: Option<Instant>,
    frozen: Option<u64>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startet den Timer; ein bereits laufender oder gestoppter Timer bleibt unverändert
    pub fn start(&mut self, epoch: Instant) {
        if self.epoch.is_none() && self.frozen.is_none() {
            self.epoch = Some(epoch);
        }
    }

    pub fn is_running(&self) -> bool {
        self.epoch.is_some() && self.frozen.is_none()
    }

    /// Volle Sekunden seit dem Start; 0 wenn nie gestartet
    pub fn elapsed(&self) -> u64 {
        if let Some(frozen) = self.frozen {
            return frozen;
        }
        self.epoch
            .map(|epoch| Instant::now().saturating_duration_since(epoch).as_secs())
            .unwrap_or(0)
    }

    /// Friert den aktuellen Wert ein
    pub fn stop(&mut self) -> u64 {
        let value = self.elapsed();
        self.frozen = Some(value);
        value
    }
}

/// Dauer als `mm:ss`
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_from_epoch() {
        let mut timer = CallTimer::new();
        assert_eq!(timer.elapsed(), 0);

        timer.start(Instant::now());
        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(timer.elapsed(), 2);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(timer.elapsed(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_value() {
        let mut timer = CallTimer::new();
        timer.start(Instant::now());
        tokio::time::advance(Duration::from_secs(7)).await;

        assert_eq!(timer.stop(), 7);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(timer.elapsed(), 7);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_is_ignored() {
        let mut timer = CallTimer::new();
        timer.start(Instant::now());
        tokio::time::advance(Duration::from_secs(4)).await;

        timer.start(Instant::now());
        assert_eq!(timer.elapsed(), 4);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(65), "01:05");
        assert_eq!(format_duration(3600), "60:00");
    }
}
