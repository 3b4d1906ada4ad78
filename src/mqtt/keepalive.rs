//! Application heartbeat, separate from the MQTT protocol keepalive.
//!
//! The heartbeat lives inside the manager task and is ticked from its
//! `select!` loop. Stopping it drops the interval, so once the state leaves
//! `Connected` no further tick can fire.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::config::HeartbeatConfig;

#[derive(Debug)]
pub struct Heartbeat {
    topic: String,
    payload: Vec<u8>,
    period: Duration,
    enabled: bool,
    interval: Option<Interval>,
}

impl Heartbeat {
    pub fn new(config: &HeartbeatConfig, default_topic: String) -> Self {
        Self {
            topic: config.topic.clone().unwrap_or(default_topic),
            payload: config.payload.clone().into_bytes(),
            period: config.interval(),
            enabled: config.enabled,
            interval: None,
        }
    }

    /// First beat fires one period after the start.
    pub fn start(&mut self) {
        if !self.enabled {
            return;
        }
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
    }

    pub fn stop(&mut self) {
        self.interval = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Resolves on the next beat; never resolves while stopped.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(interval_ms: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            interval_ms,
            ..HeartbeatConfig::default()
        }
    }

    #[test]
    fn topic_override() {
        let default = Heartbeat::new(&config(10), "client/ping".into());
        assert_eq!(default.topic(), "client/ping");
        assert_eq!(default.payload(), b"alive");

        let custom = HeartbeatConfig {
            topic: Some("fk/health/ping".into()),
            ..HeartbeatConfig::default()
        };
        assert_eq!(
            Heartbeat::new(&custom, "client/ping".into()).topic(),
            "fk/health/ping"
        );
    }

    #[tokio::test]
    async fn ticks_only_while_running() {
        let mut heartbeat = Heartbeat::new(&config(20), "c/ping".into());
        let idle = tokio::time::timeout(Duration::from_millis(60), heartbeat.tick()).await;
        assert!(idle.is_err());

        heartbeat.start();
        let beat = tokio::time::timeout(Duration::from_millis(500), heartbeat.tick()).await;
        assert!(beat.is_ok());

        heartbeat.stop();
        assert!(!heartbeat.is_running());
        let stopped = tokio::time::timeout(Duration::from_millis(60), heartbeat.tick()).await;
        assert!(stopped.is_err());
    }

    #[test]
    fn disabled_never_starts() {
        let disabled = HeartbeatConfig {
            enabled: false,
            ..HeartbeatConfig::default()
        };
        let mut heartbeat = Heartbeat::new(&disabled, "c/ping".into());
        heartbeat.start();
        assert!(!heartbeat.is_running());
    }
}
