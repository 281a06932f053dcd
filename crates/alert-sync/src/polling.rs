//! Polling fallback: periodic full refresh while the push channel is down.
//!
//! At most one recurring task exists at a time. It lives on the engine's
//! task tracker under a child of the engine's cancellation token, so engine
//! teardown stops it even if nobody calls [`PollingFallback::stop`].
//!
//! The task never touches the store. It sends fetched lists back to the
//! dispatch loop as `Command::Refresh`, keeping a single writer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use alert_core::SubjectId;

use crate::api::AlertApi;
use crate::engine::{Command, RefreshOrigin};

pub struct PollingFallback {
    api: Arc<dyn AlertApi>,
    subject: SubjectId,
    tx: mpsc::Sender<Command>,
    tracker: TaskTracker,
    parent: CancellationToken,
    interval: Duration,
    running: Option<CancellationToken>,
    launches: u32,
}

impl PollingFallback {
    pub(crate) fn new(
        api: Arc<dyn AlertApi>,
        subject: SubjectId,
        tx: mpsc::Sender<Command>,
        tracker: TaskTracker,
        parent: CancellationToken,
        interval: Duration,
    ) -> Self {
        Self {
            api,
            subject,
            tx,
            tracker,
            parent,
            interval,
            running: None,
            launches: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// How many recurring tasks have been launched over the engine's life.
    pub fn launches(&self) -> u32 {
        self.launches
    }

    /// Schedule the recurring refresh. Returns `false` if it was already running.
    pub fn start(&mut self) -> bool {
        if self.running.is_some() {
            return false;
        }
        let token = self.parent.child_token();
        self.running = Some(token.clone());
        self.launches += 1;
        info!(
            subject = %self.subject,
            interval_secs = self.interval.as_secs_f64(),
            "polling fallback started"
        );

        self.tracker.spawn(poll_loop(
            self.api.clone(),
            self.subject.clone(),
            self.tx.clone(),
            self.interval,
            token,
        ));
        true
    }

    /// Cancel the recurring refresh. Returns `false` if nothing was running.
    pub fn stop(&mut self) -> bool {
        match self.running.take() {
            Some(token) => {
                token.cancel();
                info!(subject = %self.subject, "polling fallback stopped");
                true
            }
            None => false,
        }
    }

    /// One-shot catch-up read, independent of the recurring task.
    pub fn refresh_once(&self) {
        let api = self.api.clone();
        let subject = self.subject.clone();
        let tx = self.tx.clone();
        let cancel = self.parent.child_token();
        self.tracker.spawn(async move {
            if let Some(alerts) = fetch(&*api, &subject, &cancel).await {
                let _ = tx
                    .send(Command::Refresh {
                        alerts,
                        origin: RefreshOrigin::Resync,
                    })
                    .await;
            }
        });
    }
}

async fn poll_loop(
    api: Arc<dyn AlertApi>,
    subject: SubjectId,
    tx: mpsc::Sender<Command>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(alerts) = fetch(&*api, &subject, &cancel).await else {
            if cancel.is_cancelled() {
                break;
            }
            continue;
        };
        debug!(subject = %subject, count = alerts.len(), "polling refresh fetched");
        let refresh = Command::Refresh {
            alerts,
            origin: RefreshOrigin::Poll,
        };
        if tx.send(refresh).await.is_err() {
            break;
        }
    }
    debug!(subject = %subject, "polling task exited");
}

/// Fetch once; `None` on failure or cancellation.
async fn fetch(
    api: &dyn AlertApi,
    subject: &SubjectId,
    cancel: &CancellationToken,
) -> Option<Vec<alert_core::Alert>> {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        outcome = api.fetch_alerts(subject) => outcome,
    };
    match outcome {
        Ok(alerts) => Some(alerts),
        Err(e) => {
            warn!(subject = %subject, error = %e, "alert refresh failed; keeping current data");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyncResult;
    use alert_core::Alert;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingApi {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl AlertApi for CountingApi {
        async fn fetch_alerts(&self, subject: &SubjectId) -> SyncResult<Vec<Alert>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Alert::new("a1", subject.clone(), "Bia", "oi")])
        }

        async fn mark_read(&self, _id: &str) -> SyncResult<()> {
            Ok(())
        }

        async fn remove(&self, _id: &str) -> SyncResult<()> {
            Ok(())
        }
    }

    fn fallback(
        api: Arc<CountingApi>,
        interval: Duration,
    ) -> (PollingFallback, mpsc::Receiver<Command>, TaskTracker) {
        let (tx, rx) = mpsc::channel(64);
        let tracker = TaskTracker::new();
        let polling = PollingFallback::new(
            api,
            SubjectId::new("s1"),
            tx,
            tracker.clone(),
            CancellationToken::new(),
            interval,
        );
        (polling, rx, tracker)
    }

    #[tokio::test]
    async fn repeated_start_launches_one_task() {
        let api = Arc::new(CountingApi::default());
        let (mut polling, _rx, tracker) = fallback(api, Duration::from_secs(30));

        assert!(polling.start());
        assert!(!polling.start());
        assert!(!polling.start());
        assert_eq!(polling.launches(), 1);
        assert_eq!(tracker.len(), 1);
        polling.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_ends_the_task() {
        let api = Arc::new(CountingApi::default());
        let (mut polling, _rx, tracker) = fallback(api, Duration::from_secs(30));

        assert!(!polling.stop());
        polling.start();
        assert!(polling.stop());
        assert!(!polling.stop());

        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .expect("polling task should exit after stop");
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn ticks_deliver_refresh_commands() {
        let api = Arc::new(CountingApi::default());
        let (mut polling, mut rx, _tracker) = fallback(api.clone(), Duration::from_millis(10));
        polling.start();

        for _ in 0..2 {
            let command = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("refresh within timeout")
                .expect("channel open");
            assert!(matches!(
                command,
                Command::Refresh {
                    origin: RefreshOrigin::Poll,
                    ..
                }
            ));
        }
        polling.stop();
        assert!(api.fetches.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn restart_after_stop_is_a_new_launch() {
        let api = Arc::new(CountingApi::default());
        let (mut polling, _rx, _tracker) = fallback(api, Duration::from_secs(30));
        polling.start();
        polling.stop();
        polling.start();
        assert_eq!(polling.launches(), 2);
        assert!(polling.is_running());
        polling.stop();
    }

    #[tokio::test]
    async fn refresh_once_sends_a_resync() {
        let api = Arc::new(CountingApi::default());
        let (polling, mut rx, _tracker) = fallback(api, Duration::from_secs(30));
        polling.refresh_once();
        let command = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            command,
            Command::Refresh {
                origin: RefreshOrigin::Resync,
                ..
            }
        ));
        assert!(!polling.is_running());
    }
}
