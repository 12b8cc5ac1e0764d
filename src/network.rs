//! Network Quality Monitor
//!
//! Turns host-reported connectivity signals into a discrete [`NetworkTier`]
//! and notifies subscribers once per tier transition.
//!
//! # Classification
//!
//! ```text
//! offline    no connectivity
//! very-slow  downlink < very_slow_below_mbps, or a 2G connection type
//! slow       downlink < slow_below_mbps, or 3G with no downlink hint
//! fast       everything else
//! ```
//!
//! A host that is online but reports no hints at all is classified `fast`
//! unless `assume_fast_without_hints` is turned off, in which case it is
//! classified `slow`. The optimistic default avoids throttling hosts that
//! simply lack the capability; the conservative setting trades that for
//! longer TTLs on constrained hosts that do not report metrics.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::NetworkConfig;
use crate::events::{Subscribers, Subscription};

/// Discrete link quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkTier {
    Offline,
    VerySlow,
    Slow,
    Fast,
}

impl std::fmt::Display for NetworkTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkTier::Offline => write!(f, "offline"),
            NetworkTier::VerySlow => write!(f, "very-slow"),
            NetworkTier::Slow => write!(f, "slow"),
            NetworkTier::Fast => write!(f, "fast"),
        }
    }
}

/// Connection type reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    Wifi,
    Ethernet,
    Unknown,
}

/// Raw connectivity report from the host
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectivitySignal {
    /// Whether any connectivity exists
    pub online: bool,
    /// Connection type hint
    pub connection_type: Option<ConnectionType>,
    /// Estimated downlink bandwidth (Mbps)
    pub downlink_mbps: Option<f64>,
    /// Estimated round-trip time (ms)
    pub rtt_ms: Option<u64>,
}

impl ConnectivitySignal {
    /// Online with no quality hints
    pub fn online() -> Self {
        Self {
            online: true,
            ..Default::default()
        }
    }

    /// No connectivity
    pub fn offline() -> Self {
        Self::default()
    }

    /// Online with a downlink estimate
    pub fn with_downlink(downlink_mbps: f64) -> Self {
        Self {
            online: true,
            downlink_mbps: Some(downlink_mbps),
            ..Default::default()
        }
    }
}

/// Classified network state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkQuality {
    pub online: bool,
    pub tier: NetworkTier,
    pub estimated_bandwidth_mbps: Option<f64>,
    pub estimated_latency_ms: Option<u64>,
}

impl NetworkQuality {
    /// Quality assumed before the host reports anything
    pub fn unknown_online(config: &NetworkConfig) -> Self {
        classify(&ConnectivitySignal::online(), config)
    }

    /// Check if fetches can be attempted
    pub fn is_online(&self) -> bool {
        self.online && self.tier != NetworkTier::Offline
    }
}

/// Classify a host signal
pub fn classify(signal: &ConnectivitySignal, config: &NetworkConfig) -> NetworkQuality {
    let tier = if !signal.online {
        NetworkTier::Offline
    } else if matches!(
        signal.connection_type,
        Some(ConnectionType::Slow2g | ConnectionType::TwoG)
    ) {
        NetworkTier::VerySlow
    } else if let Some(mbps) = signal.downlink_mbps {
        if mbps < config.very_slow_below_mbps {
            NetworkTier::VerySlow
        } else if mbps < config.slow_below_mbps {
            NetworkTier::Slow
        } else {
            NetworkTier::Fast
        }
    } else if signal.connection_type == Some(ConnectionType::ThreeG) {
        NetworkTier::Slow
    } else if config.assume_fast_without_hints {
        NetworkTier::Fast
    } else {
        NetworkTier::Slow
    };

    NetworkQuality {
        online: signal.online,
        tier,
        estimated_bandwidth_mbps: signal.downlink_mbps,
        estimated_latency_ms: signal.rtt_ms,
    }
}

struct MonitorState {
    current: NetworkQuality,
    last_emitted: NetworkTier,
    last_emitted_at: Option<DateTime<Utc>>,
    flush_scheduled: bool,
}

/// Network quality monitor
pub struct NetworkQualityMonitor {
    config: NetworkConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
    subscribers: Subscribers<NetworkQuality>,
    self_ref: Weak<NetworkQualityMonitor>,
}

impl NetworkQualityMonitor {
    /// Create a monitor on the system clock
    pub fn new(config: NetworkConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a monitor on a custom clock
    pub fn with_clock(config: NetworkConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let initial = NetworkQuality::unknown_online(&config);
        Arc::new_cyclic(|self_ref| Self {
            config,
            clock,
            state: Mutex::new(MonitorState {
                current: initial,
                last_emitted: initial.tier,
                last_emitted_at: None,
                flush_scheduled: false,
            }),
            subscribers: Subscribers::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Current classification
    pub fn current(&self) -> NetworkQuality {
        self.state.lock().current
    }

    /// Current tier
    pub fn tier(&self) -> NetworkTier {
        self.current().tier
    }

    /// Subscribe to tier transitions
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&NetworkQuality) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Record a connectivity change reported by the host
    pub fn report(&self, signal: ConnectivitySignal) {
        let quality = classify(&signal, &self.config);
        let now = self.clock.now();

        let emit = {
            let mut state = self.state.lock();
            state.current = quality;

            if quality.tier == state.last_emitted {
                None
            } else if quality.tier == NetworkTier::Offline || self.window_closed(&state, now) {
                state.last_emitted = quality.tier;
                state.last_emitted_at = Some(now);
                Some(quality)
            } else {
                let remaining = self.remaining_window(&state, now);
                if !state.flush_scheduled {
                    state.flush_scheduled = self.schedule_flush(remaining);
                }
                debug!(tier = %quality.tier, ?remaining, "Network transition held by debounce");
                None
            }
        };

        if let Some(quality) = emit {
            info!(tier = %quality.tier, online = quality.online, "Network quality changed");
            self.subscribers.emit(&quality);
        }
    }

    /// Emit a transition held back by the debounce window, if the current
    /// tier still differs from the last emitted one
    pub fn flush_pending(&self) -> bool {
        let now = self.clock.now();
        let emit = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            if state.current.tier == state.last_emitted {
                None
            } else {
                state.last_emitted = state.current.tier;
                state.last_emitted_at = Some(now);
                Some(state.current)
            }
        };

        match emit {
            Some(quality) => {
                info!(tier = %quality.tier, "Network quality changed (debounced)");
                self.subscribers.emit(&quality);
                true
            }
            None => false,
        }
    }

    fn window_closed(&self, state: &MonitorState, now: DateTime<Utc>) -> bool {
        self.remaining_window(state, now).is_zero()
    }

    fn remaining_window(&self, state: &MonitorState, now: DateTime<Utc>) -> Duration {
        let Some(last) = state.last_emitted_at else {
            return Duration::ZERO;
        };
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        self.config.debounce.saturating_sub(elapsed)
    }

    /// Arrange for `flush_pending` after `delay` on the ambient runtime;
    /// without one the host is expected to call `flush_pending` itself
    fn schedule_flush(&self, delay: Duration) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let weak = self.self_ref.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(monitor) = weak.upgrade() {
                monitor.flush_pending();
            }
        });
        true
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor_with_clock() -> (Arc<NetworkQualityMonitor>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let monitor = NetworkQualityMonitor::with_clock(NetworkConfig::default(), clock.clone());
        (monitor, clock)
    }

    fn counting(monitor: &NetworkQualityMonitor) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = monitor.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[test]
    fn test_classification_thresholds() {
        let config = NetworkConfig::default();

        assert_eq!(
            classify(&ConnectivitySignal::offline(), &config).tier,
            NetworkTier::Offline
        );
        assert_eq!(
            classify(&ConnectivitySignal::with_downlink(0.2), &config).tier,
            NetworkTier::VerySlow
        );
        assert_eq!(
            classify(&ConnectivitySignal::with_downlink(1.0), &config).tier,
            NetworkTier::Slow
        );
        assert_eq!(
            classify(&ConnectivitySignal::with_downlink(10.0), &config).tier,
            NetworkTier::Fast
        );

        let two_g = ConnectivitySignal {
            online: true,
            connection_type: Some(ConnectionType::TwoG),
            downlink_mbps: Some(20.0),
            rtt_ms: None,
        };
        assert_eq!(classify(&two_g, &config).tier, NetworkTier::VerySlow);

        let three_g = ConnectivitySignal {
            online: true,
            connection_type: Some(ConnectionType::ThreeG),
            ..Default::default()
        };
        assert_eq!(classify(&three_g, &config).tier, NetworkTier::Slow);
    }

    #[test]
    fn test_no_hints_default_is_configurable() {
        let optimistic = NetworkConfig::default();
        assert_eq!(
            classify(&ConnectivitySignal::online(), &optimistic).tier,
            NetworkTier::Fast
        );

        let conservative = NetworkConfig {
            assume_fast_without_hints: false,
            ..Default::default()
        };
        assert_eq!(
            classify(&ConnectivitySignal::online(), &conservative).tier,
            NetworkTier::Slow
        );
    }

    #[test]
    fn test_jitter_within_tier_is_silent() {
        let (monitor, _clock) = monitor_with_clock();
        let (count, _sub) = counting(&monitor);

        for mbps in [12.0, 9.5, 30.0, 2.0] {
            monitor.report(ConnectivitySignal::with_downlink(mbps));
        }

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.current().estimated_bandwidth_mbps, Some(2.0));
    }

    #[test]
    fn test_transition_fires_once() {
        let (monitor, clock) = monitor_with_clock();
        let (count, _sub) = counting(&monitor);

        monitor.report(ConnectivitySignal::with_downlink(1.0));
        monitor.report(ConnectivitySignal::with_downlink(1.2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.tier(), NetworkTier::Slow);

        clock.advance(chrono::Duration::seconds(5));
        monitor.report(ConnectivitySignal::with_downlink(0.1));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_debounce_holds_rapid_transitions() {
        let (monitor, clock) = monitor_with_clock();
        let (count, _sub) = counting(&monitor);

        monitor.report(ConnectivitySignal::with_downlink(1.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Flap back to fast inside the window: held
        clock.advance(chrono::Duration::milliseconds(100));
        monitor.report(ConnectivitySignal::with_downlink(10.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.tier(), NetworkTier::Fast);

        // Window closes, still fast: emitted once
        clock.advance(chrono::Duration::seconds(2));
        assert!(monitor.flush_pending());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!monitor.flush_pending());
    }

    #[test]
    fn test_flap_back_inside_window_emits_nothing() {
        let (monitor, clock) = monitor_with_clock();
        let (count, _sub) = counting(&monitor);

        monitor.report(ConnectivitySignal::with_downlink(1.0));
        clock.advance(chrono::Duration::milliseconds(100));
        monitor.report(ConnectivitySignal::with_downlink(10.0));
        clock.advance(chrono::Duration::milliseconds(100));
        monitor.report(ConnectivitySignal::with_downlink(1.1));

        assert!(!monitor.flush_pending());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_offline_bypasses_debounce() {
        let (monitor, clock) = monitor_with_clock();
        let (count, _sub) = counting(&monitor);

        monitor.report(ConnectivitySignal::with_downlink(1.0));
        clock.advance(chrono::Duration::milliseconds(10));
        monitor.report(ConnectivitySignal::offline());

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!monitor.current().is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_transition_flushes_on_runtime() {
        let (monitor, clock) = monitor_with_clock();
        let (count, _sub) = counting(&monitor);

        monitor.report(ConnectivitySignal::with_downlink(1.0));
        monitor.report(ConnectivitySignal::with_downlink(10.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::seconds(2));
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
