use chrono::Timelike;
use serde::{Deserialize, Serialize};

/// An hour range during which authentication is suppressed.
///
/// `start_hour` is inclusive and `end_hour` exclusive. A window whose start is
/// later than its end wraps past midnight (e.g. 23 -> 6).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseWindow {
    pub enabled: bool,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for PauseWindow {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: 0,
            end_hour: 6,
        }
    }
}

impl PauseWindow {
    /// Evaluated fresh on each call; the only input is the wall-clock hour.
    pub fn is_paused<T: Timelike>(&self, now: &T) -> bool {
        self.is_paused_at_hour(now.hour())
    }

    pub fn is_paused_at_hour(&self, hour: u32) -> bool {
        if !self.enabled {
            return false;
        }
        if self.start_hour <= self.end_hour {
            self.start_hour <= hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    pub fn describe(&self) -> String {
        if self.enabled {
            format!("{:02}:00-{:02}:00", self.start_hour, self.end_hour)
        } else {
            "disabled".to_string()
        }
    }
}
