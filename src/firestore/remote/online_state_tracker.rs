use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};

use crate::firestore::error::FirestoreError;
use crate::platform::runtime::{self, DelayedTask};

/// Watch failures tolerated before reporting `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// No judgement yet. Queries wait briefly before raising cached results.
    Unknown,
    Online,
    /// Cached results are raised immediately with `from_cache = true`.
    Offline,
}

#[derive(Debug)]
struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<DelayedTask>,
    should_warn_client_is_offline: bool,
}

/// Derives the online state from watch stream health.
///
/// The first connection attempt gets `timeout` to produce a frame before the client is
/// reported offline; a single watch stream failure does the same. Changes are delivered in
/// order on the receiver returned by [`OnlineStateTracker::new`].
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<Mutex<TrackerState>>,
    timeout: Duration,
    changes: Sender<OnlineState>,
}

impl OnlineStateTracker {
    pub fn new(timeout: Duration) -> (Self, Receiver<OnlineState>) {
        let (changes, receiver) = async_channel::unbounded();
        let tracker = Self {
            inner: Arc::new(Mutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                timer: None,
                should_warn_client_is_offline: true,
            })),
            timeout,
            changes,
        };
        (tracker, receiver)
    }

    pub fn state(&self) -> OnlineState {
        self.inner.lock().unwrap().state
    }

    /// Called whenever the watch stream is started.
    pub fn handle_watch_stream_start(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.watch_stream_failures != 0 || inner.timer.is_some() {
            return;
        }
        self.set_and_broadcast(&mut inner, OnlineState::Unknown);

        let tracker = self.clone();
        let timeout = self.timeout;
        inner.timer = Some(runtime::spawn_delayed(timeout, async move {
            tracker.on_timeout();
        }));
    }

    fn on_timeout(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.timer = None;
        if inner.state != OnlineState::Unknown {
            return;
        }
        Self::log_offline_warning(
            &mut inner,
            format!("Backend didn't respond within {} seconds", self.timeout.as_secs()),
        );
        self.set_and_broadcast(&mut inner, OnlineState::Offline);
    }

    pub fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == OnlineState::Online {
            self.set_and_broadcast(&mut inner, OnlineState::Unknown);
            return;
        }
        inner.watch_stream_failures += 1;
        if inner.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            let failures = inner.watch_stream_failures;
            Self::clear_timer(&mut inner);
            Self::log_offline_warning(
                &mut inner,
                format!("Connection failed {failures} times. Most recent error: {error}"),
            );
            self.set_and_broadcast(&mut inner, OnlineState::Offline);
        }
    }

    /// Explicit transition, e.g. `Online` after a watch frame or `Offline` when the network is
    /// disabled. Resets the failure count.
    pub fn set(&self, state: OnlineState) {
        let mut inner = self.inner.lock().unwrap();
        Self::clear_timer(&mut inner);
        inner.watch_stream_failures = 0;
        if state == OnlineState::Online {
            inner.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(&mut inner, state);
    }

    fn set_and_broadcast(&self, inner: &mut TrackerState, state: OnlineState) {
        if inner.state != state {
            inner.state = state;
            let _ = self.changes.try_send(state);
        }
    }

    fn clear_timer(inner: &mut TrackerState) {
        if let Some(timer) = inner.timer.take() {
            timer.cancel();
        }
    }

    fn log_offline_warning(inner: &mut TrackerState, details: String) {
        let message = format!(
            "Could not reach the backend. {details}. The client will operate in offline mode until it can connect."
        );
        if inner.should_warn_client_is_offline {
            log::warn!(target: "firestore::online_state", "{message}");
            inner.should_warn_client_is_offline = false;
        } else {
            log::debug!(target: "firestore::online_state", "{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    fn drain(receiver: &Receiver<OnlineState>) -> Vec<OnlineState> {
        let mut states = Vec::new();
        while let Ok(state) = receiver.try_recv() {
            states.push(state);
        }
        states
    }

    #[tokio::test]
    async fn first_failure_goes_offline() {
        let (tracker, changes) = OnlineStateTracker::new(Duration::from_secs(10));
        tracker.handle_watch_stream_start();
        tracker.handle_watch_stream_failure(&unavailable("down"));
        assert_eq!(tracker.state(), OnlineState::Offline);

        tracker.set(OnlineState::Online);
        // Losing an established connection only drops back to unknown.
        tracker.handle_watch_stream_failure(&unavailable("blip"));
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(
            drain(&changes),
            vec![OnlineState::Offline, OnlineState::Online, OnlineState::Unknown]
        );
    }

    #[tokio::test]
    async fn timeout_reports_offline() {
        let (tracker, changes) = OnlineStateTracker::new(Duration::from_millis(20));
        tracker.handle_watch_stream_start();
        runtime::sleep(Duration::from_millis(80)).await;
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(drain(&changes), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn online_frame_cancels_timeout() {
        let (tracker, changes) = OnlineStateTracker::new(Duration::from_millis(20));
        tracker.handle_watch_stream_start();
        tracker.set(OnlineState::Online);
        runtime::sleep(Duration::from_millis(80)).await;
        assert_eq!(tracker.state(), OnlineState::Online);
        assert_eq!(drain(&changes), vec![OnlineState::Online]);
    }
}
