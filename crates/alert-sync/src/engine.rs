//! The per-session sync engine and its dispatch loop.
//!
//! ## Lifecycle
//!
//! ```text
//! SyncEngine::spawn(config, deps, identity) → EngineHandle
//!   → resolve subject (single-flight, retried every identity_retry_interval)
//!   → bootstrap read → AlertStore::initialize
//!   → ChangeFeedClient::open
//!   → loop over one queue:
//!       Feed{generation, event|status}   change feed
//!       Attached{generation, outcome}    provider subscribe finished
//!       Refresh{alerts}                  polling fallback / resync
//!       MarkRead(id) | Remove(id)        operator commands
//!       handshake / retry / trial timers
//!   → teardown: close subscription, stop polling, cancel every task
//! ```
//!
//! The loop is the only writer of the store. Everything else it spawns
//! (polling, remote mutations, one-shot refreshes) lives on one
//! `TaskTracker` under one root `CancellationToken`, so
//! [`EngineHandle::shutdown`] leaves nothing running behind it.
//! Provider subscribe and unsubscribe calls run on that tracker too; the
//! loop itself never awaits a collaborator after bootstrap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use alert_core::{
    Alert, AlertEvent, AlertStore, Applied, ChannelStatus, ConnectionState, SubjectId,
};

use crate::api::{AlertApi, IdentityApi};
use crate::config::SyncConfig;
use crate::errors::{SyncError, SyncResult};
use crate::feed::{ChangeFeedClient, ChangeFeedProvider, FeedMessage, SubscriptionHandle};
use crate::identity::IdentityResolver;
use crate::monitor::{ReliabilityMonitor, Verdict};
use crate::mutation::MutationGateway;
use crate::notify::{NotificationHost, NotificationSink};
use crate::polling::PollingFallback;

/// Queue capacity for the dispatch loop.
const COMMAND_CAPACITY: usize = 256;

/// Where a full-list refresh came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOrigin {
    /// Recurring polling fallback tick.
    Poll,
    /// One-shot catch-up after the push channel recovered.
    Resync,
}

/// Everything the dispatch loop consumes.
#[derive(Debug)]
pub(crate) enum Command {
    Feed { generation: u64, message: FeedMessage },
    Attached {
        generation: u64,
        outcome: SyncResult<SubscriptionHandle>,
    },
    Refresh { alerts: Vec<Alert>, origin: RefreshOrigin },
    MarkRead(String),
    Remove(String),
}

/// External collaborators for one engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub identity: Arc<dyn IdentityApi>,
    pub alerts: Arc<dyn AlertApi>,
    pub feed: Arc<dyn ChangeFeedProvider>,
    pub notifier: Arc<dyn NotificationHost>,
}

/// Read-only view published after every dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSnapshot {
    pub subject: Option<SubjectId>,
    /// All mirrored alerts, most recent first.
    pub alerts: Vec<Alert>,
    pub unread_count: usize,
    pub connection: ConnectionState,
    pub failure_count: u32,
    pub circuit_open: bool,
    pub polling: bool,
    /// Recurring polling tasks launched so far.
    pub fallback_launches: u32,
    /// A full list has been applied at least once.
    pub bootstrapped: bool,
}

impl EngineSnapshot {
    /// The default consumer view: unread alerts only.
    pub fn unread(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| !a.is_read)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.alerts.iter().map(|a| a.id.as_str()).collect()
    }
}

/// Returned by [`EngineHandle::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tracked tasks still alive after shutdown. Always zero.
    pub remaining_tasks: usize,
}

pub struct SyncEngine;

impl SyncEngine {
    /// Start an engine for `identity`. Must be called inside a Tokio runtime.
    pub fn spawn(
        config: SyncConfig,
        deps: EngineDeps,
        identity: impl Into<String>,
    ) -> EngineHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshots_tx, snapshots_rx) = watch::channel(EngineSnapshot::default());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let bootstrap = Bootstrap {
            config,
            deps,
            identity: identity.into(),
            tx: tx.clone(),
            rx,
            snapshots: snapshots_tx,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        };
        tracker.spawn(bootstrap.run());

        EngineHandle {
            commands: tx,
            snapshots: snapshots_rx,
            _guard: cancel.clone().drop_guard(),
            cancel,
            tracker,
        }
    }
}

/// Caller-side handle. Dropping it cancels the engine.
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<EngineSnapshot>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    _guard: DropGuard,
}

impl EngineHandle {
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until a snapshot satisfies `predicate`, or give up after `timeout`.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&EngineSnapshot) -> bool,
    ) -> Option<EngineSnapshot> {
        let mut rx = self.snapshots.clone();
        let snapshot = tokio::time::timeout(timeout, rx.wait_for(predicate))
            .await
            .ok()?
            .ok()?;
        Some(EngineSnapshot::clone(&snapshot))
    }

    /// Acknowledge an alert. Returns `false` if the engine has stopped.
    pub async fn mark_read(&self, id: impl Into<String>) -> bool {
        self.commands.send(Command::MarkRead(id.into())).await.is_ok()
    }

    /// Remove an alert. Returns `false` if the engine has stopped.
    pub async fn remove(&self, id: impl Into<String>) -> bool {
        self.commands.send(Command::Remove(id.into())).await.is_ok()
    }

    /// Tracked tasks currently alive (dispatch loop included).
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel everything and wait for every tracked task to finish.
    pub async fn shutdown(self) -> ShutdownReport {
        let EngineHandle {
            cancel, tracker, ..
        } = self;
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        ShutdownReport {
            remaining_tasks: tracker.len(),
        }
    }
}

/// Pre-subject phase: owns everything until the subject is known.
struct Bootstrap {
    config: SyncConfig,
    deps: EngineDeps,
    identity: String,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    snapshots: watch::Sender<EngineSnapshot>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Bootstrap {
    async fn run(self) {
        info!(identity = %self.identity, "alert sync engine starting");
        let resolver = IdentityResolver::new(
            self.deps.identity.clone(),
            self.identity.clone(),
            self.cancel.child_token(),
        );

        let subject = loop {
            if let Some(subject) = resolver.resolve().await {
                break subject;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(
                        identity = %self.identity,
                        "alert sync engine stopped before subject resolved"
                    );
                    self.snapshots.send_replace(EngineSnapshot::default());
                    return;
                }
                _ = tokio::time::sleep(self.config.identity_retry_interval) => {
                    debug!(identity = %self.identity, "retrying subject resolution");
                }
            }
        };

        info!(identity = %self.identity, subject = %subject, "subject resolved");
        let mut session = Session::new(self, subject);
        session.run().await;
    }
}

/// Post-subject phase: the dispatch loop and everything it owns.
struct Session {
    subject: SubjectId,
    config: SyncConfig,
    store: AlertStore,
    feed: ChangeFeedClient,
    monitor: ReliabilityMonitor,
    polling: PollingFallback,
    gateway: MutationGateway,
    notifier: NotificationSink,
    alerts_api: Arc<dyn AlertApi>,
    rx: mpsc::Receiver<Command>,
    snapshots: watch::Sender<EngineSnapshot>,
    cancel: CancellationToken,
    bootstrapped: bool,
}

impl Session {
    fn new(boot: Bootstrap, subject: SubjectId) -> Self {
        let Bootstrap {
            config,
            deps,
            tx,
            rx,
            snapshots,
            cancel,
            tracker,
            ..
        } = boot;

        let feed = ChangeFeedClient::new(
            deps.feed,
            tx.clone(),
            tracker.clone(),
            cancel.child_token(),
            config.handshake_timeout,
            config.retry_delay,
        );
        let monitor =
            ReliabilityMonitor::new(config.max_retries, config.log_every, config.trial_interval);
        let polling = PollingFallback::new(
            deps.alerts.clone(),
            subject.clone(),
            tx,
            tracker.clone(),
            cancel.clone(),
            config.poll_interval,
        );
        let gateway = MutationGateway::new(deps.alerts.clone(), tracker, cancel.child_token());
        let notifier = NotificationSink::new(deps.notifier, config.preview_chars);

        Self {
            subject,
            config,
            store: AlertStore::new(),
            feed,
            monitor,
            polling,
            gateway,
            notifier,
            alerts_api: deps.alerts,
            rx,
            snapshots,
            cancel,
            bootstrapped: false,
        }
    }

    async fn run(&mut self) {
        self.bootstrap().await;
        if !self.cancel.is_cancelled() {
            self.open_feed();
        }
        self.publish();

        loop {
            let handshake = self.feed.handshake_deadline();
            let retry = self.feed.retry_at();
            let trial = self.monitor.trial_at();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.dispatch(command),
                    None => break,
                },
                _ = sleep_until(handshake) => {
                    let err = SyncError::HandshakeTimeout(self.config.handshake_timeout);
                    self.on_channel_failure(err);
                }
                _ = sleep_until(retry) => {
                    self.feed.clear_retry();
                    self.open_feed();
                }
                _ = sleep_until(trial) => {
                    self.monitor.clear_trial();
                    self.start_trial();
                }
            }
            self.publish();
        }

        self.teardown();
    }

    async fn bootstrap(&mut self) {
        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            fetched = self.alerts_api.fetch_alerts(&self.subject) => fetched,
        };
        match fetched {
            Ok(alerts) => {
                self.store.initialize(alerts);
                self.bootstrapped = true;
                info!(
                    subject = %self.subject,
                    count = self.store.len(),
                    unread = self.store.unread_count(),
                    "bootstrap complete"
                );
            }
            Err(e) => {
                warn!(
                    subject = %self.subject,
                    error = %e,
                    "bootstrap read failed; waiting for feed or polling"
                );
            }
        }
    }

    fn open_feed(&mut self) {
        self.feed.open(&self.subject, &self.monitor, &mut self.polling);
    }

    fn start_trial(&mut self) {
        debug!(subject = %self.subject, "trying push channel while degraded");
        self.feed.connect(&self.subject);
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Feed {
                generation,
                message,
            } => {
                if !self.feed.is_current(generation) {
                    debug!(generation, "dropping message from released subscription");
                    return;
                }
                match message {
                    FeedMessage::Event(event) => self.apply_event(event),
                    FeedMessage::Status(status) => self.on_status(status),
                }
            }
            Command::Attached {
                generation,
                outcome,
            } => {
                if let Err(e) = self.feed.attach(generation, outcome) {
                    self.on_channel_failure(e);
                }
            }
            Command::Refresh { alerts, origin } => self.apply_refresh(alerts, origin),
            Command::MarkRead(id) => {
                self.gateway.mark_read(&mut self.store, &id);
            }
            Command::Remove(id) => {
                self.gateway.remove(&mut self.store, &id);
            }
        }
    }

    fn apply_event(&mut self, event: AlertEvent) {
        let foreign = match &event {
            AlertEvent::Insert(alert) | AlertEvent::Update(alert) => {
                alert.subject_id != self.subject
            }
            AlertEvent::Delete { .. } => false,
        };
        if foreign {
            debug!(alert_id = event.alert_id(), "ignoring event for another subject");
            return;
        }

        let kind = event.kind();
        let alert_id = event.alert_id().to_string();
        match self.store.apply(event) {
            Applied::Inserted(alert) => {
                self.notifier.notify(&alert);
            }
            Applied::Ignored => debug!(alert_id = %alert_id, kind, "event ignored"),
            Applied::Updated | Applied::Deleted => {
                debug!(alert_id = %alert_id, kind, "event applied")
            }
        }
    }

    fn apply_refresh(&mut self, alerts: Vec<Alert>, origin: RefreshOrigin) {
        let fresh = self.store.initialize(alerts);
        self.bootstrapped = true;
        debug!(?origin, total = self.store.len(), new = fresh.len(), "refresh applied");
        for alert in &fresh {
            self.notifier.notify(alert);
        }
    }

    fn on_status(&mut self, status: ChannelStatus) {
        match status {
            ChannelStatus::Subscribed => {
                self.feed.mark_subscribed();
                let recovered = self.monitor.on_subscribed();
                self.polling.stop();
                if recovered || !self.bootstrapped {
                    self.polling.refresh_once();
                }
                info!(
                    subject = %self.subject,
                    generation = self.feed.generation(),
                    "change feed subscribed"
                );
            }
            ChannelStatus::ChannelError(reason) => {
                self.on_channel_failure(SyncError::Subscription(reason));
            }
            ChannelStatus::TimedOut => {
                let err = SyncError::HandshakeTimeout(self.config.handshake_timeout);
                self.on_channel_failure(err);
            }
        }
    }

    fn on_channel_failure(&mut self, error: SyncError) {
        // Stopping is not a channel failure.
        if self.cancel.is_cancelled() {
            return;
        }
        self.feed.release();
        match self.monitor.on_failure(&error) {
            Verdict::Retry => self.feed.schedule_retry(),
            Verdict::OpenCircuit | Verdict::StayDegraded => {
                self.polling.start();
                self.feed.mark_degraded();
            }
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            subject: Some(self.subject.clone()),
            alerts: self.store.list().to_vec(),
            unread_count: self.store.unread_count(),
            connection: self.feed.state(),
            failure_count: self.monitor.failure_count(),
            circuit_open: self.monitor.is_circuit_open(),
            polling: self.polling.is_running(),
            fallback_launches: self.polling.launches(),
            bootstrapped: self.bootstrapped,
        }
    }

    /// Runs on every exit path of the loop.
    fn teardown(&mut self) {
        self.feed.close();
        self.polling.stop();
        self.monitor.clear_trial();
        self.cancel.cancel();

        // Handles that arrived after the loop stopped still go back to the provider.
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            if let Command::Attached {
                generation,
                outcome: Ok(handle),
            } = command
            {
                self.feed.release_handle(generation, handle);
            }
        }
        self.publish();
        info!(subject = %self.subject, "alert sync engine stopped");
    }
}

impl Drop for Session {
    /// An unwinding loop skips `teardown`; stop the engine anyway.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
