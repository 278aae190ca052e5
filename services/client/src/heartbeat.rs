//! Heartbeat supervision for provider subscriptions.
//!
//! Servers publish `beat` messages carrying their `min_interval`. When a
//! subscription goes `alarm_scale × min_interval` seconds without traffic,
//! the listener tears the connection down and rebuilds it. A scale of zero
//! disables the alarm entirely.

use std::time::Duration;

use tracing::debug;

use ferry_protocol::{Message, MessageType, DEFAULT_MIN_INTERVAL};

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    alarm_scale: f64,
    min_interval: f64,
}

impl HeartbeatMonitor {
    pub fn new(alarm_scale: f64) -> HeartbeatMonitor {
        HeartbeatMonitor {
            alarm_scale,
            min_interval: DEFAULT_MIN_INTERVAL,
        }
    }

    pub fn enabled(&self) -> bool {
        self.alarm_scale > 0.0
    }

    /// Feed a received message; a `beat` updates the expected interval.
    pub fn record(&mut self, msg: &Message) {
        if msg.mtype != MessageType::Beat {
            return;
        }
        if let Some(min_interval) = msg.min_interval() {
            if min_interval > 0.0 {
                self.min_interval = min_interval;
            }
        }
        debug!(deadline = ?self.alarm_after(), "heartbeat alarm timer reset");
    }

    /// How long silence is tolerated before the subscription restarts.
    pub fn alarm_after(&self) -> Duration {
        Duration::from_secs_f64(self.alarm_scale * self.min_interval)
    }
}
