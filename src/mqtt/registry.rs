//! Desired subscriptions and wildcard dispatch.
//!
//! The registry is the single source of truth for what the client should be
//! subscribed to. It survives every reconnect and is replayed in
//! registration order by [`Registry::resubscribe_all`].

use std::fmt;
use std::sync::Arc;

use rumqttc::QoS;
use tracing::debug;

/// Delivery callback for one filter: `(topic, payload)`.
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Clone)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
    pub callback: MessageCallback,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

#[derive(Default, Debug)]
pub struct Registry {
    subscriptions: Vec<Subscription>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces by filter. A replaced entry keeps its position.
    pub fn upsert(&mut self, filter: &str, qos: QoS, callback: MessageCallback) {
        match self.subscriptions.iter_mut().find(|s| s.filter == filter) {
            Some(existing) => {
                debug!("Replacing subscription for {}", filter);
                existing.qos = qos;
                existing.callback = callback;
            }
            None => {
                debug!("Registering subscription for {}", filter);
                self.subscriptions.push(Subscription {
                    filter: filter.to_string(),
                    qos,
                    callback,
                });
            }
        }
    }

    /// Returns whether the filter was registered.
    pub fn remove(&mut self, filter: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.filter != filter);
        before != self.subscriptions.len()
    }

    pub fn qos_of(&self, filter: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .find(|s| s.filter == filter)
            .map(|s| s.qos)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn filters(&self) -> Vec<(String, QoS)> {
        self.subscriptions
            .iter()
            .map(|s| (s.filter.clone(), s.qos))
            .collect()
    }

    /// First subscription in registration order whose filter matches `topic`.
    pub fn find_first(&self, topic: &str) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .find(|s| topic_matches(&s.filter, topic))
    }

    /// Re-issues every filter through `subscribe`. Failures are collected per
    /// filter and never stop the remaining filters.
    pub fn resubscribe_all<E>(
        &self,
        mut subscribe: impl FnMut(&str, QoS) -> Result<(), E>,
    ) -> Vec<(String, E)> {
        let mut failures = Vec::new();
        for subscription in &self.subscriptions {
            if let Err(e) = subscribe(&subscription.filter, subscription.qos) {
                failures.push((subscription.filter.clone(), e));
            }
        }
        failures
    }
}

/// MQTT topic filter matching.
///
/// `+` matches exactly one level, `#` matches the remainder including the
/// parent level itself. Topics starting with `$` never match a leading
/// wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
