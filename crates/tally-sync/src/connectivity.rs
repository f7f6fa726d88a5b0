//! # Connectivity Monitor
//!
//! Tracks whether the backend is reachable and tells the rest of the
//! runtime when that changes.
//!
//! ## Signal Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  host / ReachabilityCheck ──► report_reachability(bool) ─┐             │
//! │                                                          ▼             │
//! │  offline-mode toggle ──────► set_forced_offline(bool) ─► LinkSignal    │
//! │                                                          │             │
//! │                         online = reachable && !forced    │             │
//! │                                                          ▼             │
//! │                                    changed? ── no ──► swallowed        │
//! │                                       │                                │
//! │                                      yes                               │
//! │                                       ▼                                │
//! │                  watch<bool> (engine)   broadcast<ConnectivityEvent>   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    WentOnline,
    WentOffline,
}

impl std::fmt::Display for ConnectivityEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityEvent::WentOnline => write!(f, "went_online"),
            ConnectivityEvent::WentOffline => write!(f, "went_offline"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkSignal {
    reachable: bool,
    forced_offline: bool,
}

impl LinkSignal {
    fn online(&self) -> bool {
        self.reachable && !self.forced_offline
    }
}

// =============================================================================
// Monitor
// =============================================================================

pub struct ConnectivityMonitor {
    signal: watch::Sender<LinkSignal>,
    online: watch::Sender<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(initially_reachable: bool) -> Self {
        let signal = LinkSignal {
            reachable: initially_reachable,
            forced_offline: false,
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        ConnectivityMonitor {
            signal: watch::Sender::new(signal),
            online: watch::Sender::new(signal.online()),
            events,
        }
    }

    /// Feeds a raw reachability signal. Returns the event it caused, if the
    /// effective state changed.
    pub fn report_reachability(&self, reachable: bool) -> Option<ConnectivityEvent> {
        self.update(|signal| signal.reachable = reachable)
    }

    /// Applies the user's offline-mode toggle.
    pub fn set_forced_offline(&self, forced: bool) -> Option<ConnectivityEvent> {
        self.update(|signal| signal.forced_offline = forced)
    }

    fn update(&self, apply: impl FnOnce(&mut LinkSignal)) -> Option<ConnectivityEvent> {
        let mut event = None;
        self.signal.send_if_modified(|signal| {
            let was_online = signal.online();
            apply(signal);
            let now_online = signal.online();
            if was_online == now_online {
                return false;
            }

            let transition = if now_online {
                ConnectivityEvent::WentOnline
            } else {
                ConnectivityEvent::WentOffline
            };
            self.online.send_replace(now_online);
            // No subscribers is fine; the watch view still updates.
            let _ = self.events.send(transition);
            event = Some(transition);
            true
        });

        match event {
            Some(transition) => info!(event = %transition, "Connectivity changed"),
            None => debug!("Connectivity signal unchanged"),
        }
        event
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn is_forced_offline(&self) -> bool {
        self.signal.borrow().forced_offline
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Live view of the effective online state.
    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Polls `check` every `interval` and feeds the result into the monitor.
    /// The task ends when the monitor is dropped.
    pub fn spawn_reachability_check(
        self: &Arc<Self>,
        check: Arc<dyn ReachabilityCheck>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = check.is_reachable().await;
                let Some(monitor) = monitor.upgrade() else {
                    debug!("Connectivity monitor dropped, stopping check");
                    break;
                };
                monitor.report_reachability(reachable);
            }
        })
    }
}

/// Resolves once `rx` reports offline. Stays pending if the monitor is gone.
pub async fn wait_offline(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|online| !*online).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// Reachability check
// =============================================================================

/// Host-provided reachability check, e.g. a health endpoint ping.
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_repeated_signals_are_debounced() {
        let monitor = ConnectivityMonitor::new(false);
        let mut events = monitor.subscribe();

        assert_eq!(monitor.report_reachability(true), Some(ConnectivityEvent::WentOnline));
        assert_eq!(monitor.report_reachability(true), None);
        assert_eq!(monitor.report_reachability(false), Some(ConnectivityEvent::WentOffline));
        assert_eq!(monitor.report_reachability(false), None);

        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::WentOnline);
        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::WentOffline);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_forced_offline_masks_reachability() {
        let monitor = ConnectivityMonitor::new(true);
        assert!(monitor.is_online());

        assert_eq!(monitor.set_forced_offline(true), Some(ConnectivityEvent::WentOffline));
        // Still forced: reachability changes are invisible.
        assert_eq!(monitor.report_reachability(false), None);
        assert_eq!(monitor.report_reachability(true), None);
        assert!(!monitor.is_online());

        assert_eq!(monitor.set_forced_offline(false), Some(ConnectivityEvent::WentOnline));
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_wait_offline_resolves_on_transition() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.watch_online();

        let waiter = tokio::spawn(async move { wait_offline(&mut rx).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        monitor.report_reachability(false);
        waiter.await.unwrap();
    }

    struct FlagCheck(Arc<AtomicBool>);

    #[async_trait]
    impl ReachabilityCheck for FlagCheck {
        async fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reachability_check_feeds_monitor() {
        let flag = Arc::new(AtomicBool::new(true));
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let mut events = monitor.subscribe();

        let task = monitor.spawn_reachability_check(Arc::new(FlagCheck(flag.clone())), Duration::from_secs(5));
        assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::WentOnline);

        flag.store(false, Ordering::SeqCst);
        assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::WentOffline);

        drop(monitor);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(task.is_finished());
    }
}
