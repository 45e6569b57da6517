//! Broker status, connection-status watchers, and the boundary aggregation
//! used by the coordinator.

use std::collections::HashSet;
use std::fmt;

use tokio::sync::oneshot;

/// Per-broker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Connecting,
    Connected,
    Stopping,
    Disconnected,
    Closed,
    Failed,
}

impl Status {
    /// Usable for new operations: connecting or connected.
    pub fn is_usable(self) -> bool {
        matches!(self, Status::Connecting | Status::Connected)
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Status::Connected)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Status::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Closed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Stopping => "stopping",
            Status::Disconnected => "disconnected",
            Status::Closed => "closed",
            Status::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Aggregation policy for connection-status watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Any,
    All,
}

/// The outcome delivered to a registered watcher's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Connected,
    Disconnected,
    Failed,
    Timeout,
}

pub type WatcherId = u64;

/// Options governing when a watcher fires.
pub struct ConnectionStatusOptions {
    pub boundary: Boundary,
    /// If set, only transitions touching these identities are considered.
    pub brokers: Option<Vec<String>>,
    /// If set, the watcher unregisters and fires `Timeout` after this many
    /// seconds unless a real transition fires it first.
    pub one_off: Option<u64>,
}

impl Default for ConnectionStatusOptions {
    fn default() -> Self {
        Self {
            boundary: Boundary::Any,
            brokers: None,
            one_off: None,
        }
    }
}

pub(crate) struct Watcher {
    pub id: WatcherId,
    pub options: ConnectionStatusOptions,
    pub callback: Box<dyn Fn(StatusEvent) + Send + Sync>,
    pub fired: bool,
    pub cancel_timer: Option<oneshot::Sender<()>>,
}

impl Watcher {
    fn matches(&self, identity: &str) -> bool {
        match &self.options.brokers {
            None => true,
            Some(list) => list.iter().any(|b| b == identity),
        }
    }
}

/// Tracks registered watchers and fires their boundary-crossing events.
/// Owned by the coordinator under its single mutex.
#[derive(Default)]
pub struct WatcherRegistry {
    watchers: Vec<Watcher>,
    next_id: WatcherId,
}

impl WatcherRegistry {
    pub fn register(
        &mut self,
        options: ConnectionStatusOptions,
        callback: impl Fn(StatusEvent) + Send + Sync + 'static,
    ) -> (WatcherId, Option<(u64, oneshot::Receiver<()>)>) {
        let id = self.next_id;
        self.next_id += 1;

        let (cancel_tx, timer_rx) = if let Some(secs) = options.one_off {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some((secs, rx)))
        } else {
            (None, None)
        };

        self.watchers.push(Watcher {
            id,
            options,
            callback: Box::new(callback),
            fired: false,
            cancel_timer: cancel_tx,
        });
        (id, timer_rx)
    }

    pub fn unregister(&mut self, id: WatcherId) {
        self.watchers.retain(|w| w.id != id);
    }

    /// Fire `Timeout` for a one-off watcher whose timer elapsed, unless it
    /// already fired from a real transition.
    pub fn fire_timeout(&mut self, id: WatcherId) {
        if let Some(pos) = self.watchers.iter().position(|w| w.id == id) {
            let watcher = &self.watchers[pos];
            if !watcher.fired {
                (watcher.callback)(StatusEvent::Timeout);
            }
            self.watchers.remove(pos);
        }
    }

    /// Given the identity that just transitioned and the full before/after
    /// connected sets (over all configured brokers) plus the full failed
    /// set, evaluate every watcher and fire as appropriate. One-off watchers
    /// that fire are unregistered (their timers are cancelled).
    pub fn on_transition(
        &mut self,
        identity: &str,
        before_connected: &HashSet<String>,
        after_connected: &HashSet<String>,
        all_failed: &HashSet<String>,
        all_identities: &HashSet<String>,
    ) {
        let mut fired_ids = Vec::new();

        for watcher in &mut self.watchers {
            if !watcher.matches(identity) {
                continue;
            }

            let relevant: HashSet<&String> = match &watcher.options.brokers {
                Some(list) => list.iter().collect(),
                None => all_identities.iter().collect(),
            };
            let n = relevant.len();
            if n == 0 {
                continue;
            }

            let before_n = relevant.iter().filter(|id| before_connected.contains(**id)).count();
            let after_n = relevant.iter().filter(|id| after_connected.contains(**id)).count();
            let failed_n = relevant.iter().filter(|id| all_failed.contains(**id)).count();

            let event = if failed_n == n {
                Some(StatusEvent::Failed)
            } else {
                match watcher.options.boundary {
                    Boundary::Any => {
                        if before_n == 0 && after_n > 0 {
                            Some(StatusEvent::Connected)
                        } else if before_n > 0 && after_n == 0 {
                            Some(StatusEvent::Disconnected)
                        } else {
                            None
                        }
                    }
                    Boundary::All => {
                        if before_n < n && after_n == n {
                            Some(StatusEvent::Connected)
                        } else if before_n == n && after_n < n {
                            Some(StatusEvent::Disconnected)
                        } else {
                            None
                        }
                    }
                }
            };

            if let Some(event) = event {
                (watcher.callback)(event);
                watcher.fired = true;
                if watcher.options.one_off.is_some() {
                    if let Some(tx) = watcher.cancel_timer.take() {
                        let _ = tx.send(());
                    }
                    fired_ids.push(watcher.id);
                }
            }
        }

        for id in fired_ids {
            self.watchers.retain(|w| w.id != id);
        }
    }
}

/// `{identity, alias, status, disconnects, failures, retries}`.
#[derive(Debug, Clone)]
pub struct StatusSummary {
    pub identity: String,
    pub alias: String,
    pub status: Status,
    pub disconnects: u64,
    pub failures: u64,
    pub retries: u64,
}

/// Statistics record: counters are `None` when zero, and the last
/// disconnect/failure timestamps are carried as `chrono::DateTime<Utc>`.
#[derive(Debug, Clone)]
pub struct StatsRecord {
    pub alias: String,
    pub identity: String,
    pub status: String,
    pub disconnects: Option<u64>,
    pub disconnect_last: Option<chrono::DateTime<chrono::Utc>>,
    pub failures: Option<u64>,
    pub failure_last: Option<chrono::DateTime<chrono::Utc>>,
    pub retries: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ids(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn any_boundary_fires_connected_on_zero_to_one() {
        let mut reg = WatcherRegistry::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        reg.register(
            ConnectionStatusOptions {
                boundary: Boundary::Any,
                brokers: None,
                one_off: None,
            },
            move |e| {
                if e == StatusEvent::Connected {
                    fired2.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        reg.on_transition(
            "b0",
            &ids(&[]),
            &ids(&["b0"]),
            &ids(&[]),
            &ids(&["b0", "b1"]),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn all_boundary_fires_disconnected_on_n_to_n_minus_1() {
        let mut reg = WatcherRegistry::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        reg.register(
            ConnectionStatusOptions {
                boundary: Boundary::All,
                brokers: None,
                one_off: None,
            },
            move |e| {
                if e == StatusEvent::Disconnected {
                    fired2.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        reg.on_transition(
            "b0",
            &ids(&["b0", "b1"]),
            &ids(&["b1"]),
            &ids(&[]),
            &ids(&["b0", "b1"]),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_fires_when_all_relevant_failed() {
        let mut reg = WatcherRegistry::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        reg.register(
            ConnectionStatusOptions {
                boundary: Boundary::Any,
                brokers: None,
                one_off: None,
            },
            move |e| {
                if e == StatusEvent::Failed {
                    fired2.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        reg.on_transition(
            "b0",
            &ids(&[]),
            &ids(&[]),
            &ids(&["b0"]),
            &ids(&["b0"]),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_off_unregisters_after_firing() {
        let mut reg = WatcherRegistry::default();
        let (id, _timer) = reg.register(
            ConnectionStatusOptions {
                boundary: Boundary::Any,
                brokers: None,
                one_off: Some(5),
            },
            |_| {},
        );
        reg.on_transition("b0", &ids(&[]), &ids(&["b0"]), &ids(&[]), &ids(&["b0"]));
        assert!(!reg.watchers.iter().any(|w| w.id == id));
    }
}
