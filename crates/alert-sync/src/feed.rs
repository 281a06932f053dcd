//! Change-feed subscription management.
//!
//! The push channel itself is an external capability behind
//! [`ChangeFeedProvider`]. The provider pushes decoded [`FeedMessage`]s into
//! a [`FeedSink`]; every sink is stamped with the generation of the attempt
//! that created it, so messages from a released attempt are recognised and
//! dropped by the dispatch loop.
//!
//! Provider calls never run on the dispatch loop. `subscribe` runs as a
//! tracked task that reports its outcome back as `Command::Attached`;
//! `unsubscribe` runs as a tracked task bounded by the handshake timeout.
//!
//! ## State machine
//!
//! ```text
//! Closed ──open──▶ Connecting ──Subscribed──▶ Subscribed
//!                     │  ▲                        │
//!            error /  │  │ retry_delay            │ error
//!            timeout  ▼  │                        ▼
//!                   (release) ◀────────────────────┘
//!                     │
//!                     └── circuit open ──▶ Degraded (polling live)
//! ```
//!
//! Any state ──close──▶ Closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use alert_core::{AlertEvent, ChannelStatus, ConnectionState, SubjectId};

use crate::engine::Command;
use crate::errors::{SyncError, SyncResult};
use crate::monitor::ReliabilityMonitor;
use crate::polling::PollingFallback;

/// Opaque provider-issued subscription id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// What a provider can push for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    Event(AlertEvent),
    Status(ChannelStatus),
}

/// Write end handed to a provider for one subscription attempt.
#[derive(Debug, Clone)]
pub struct FeedSink {
    generation: u64,
    tx: mpsc::Sender<Command>,
}

impl FeedSink {
    pub(crate) fn new(generation: u64, tx: mpsc::Sender<Command>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a message, waiting for capacity. Returns `false` once the engine is gone.
    pub async fn send(&self, message: FeedMessage) -> bool {
        self.tx
            .send(Command::Feed {
                generation: self.generation,
                message,
            })
            .await
            .is_ok()
    }

    /// Queue a message without waiting; for providers driven by sync callbacks.
    pub fn try_send(&self, message: FeedMessage) -> bool {
        self.tx
            .try_send(Command::Feed {
                generation: self.generation,
                message,
            })
            .is_ok()
    }

    pub async fn event(&self, event: AlertEvent) -> bool {
        self.send(FeedMessage::Event(event)).await
    }

    pub async fn status(&self, status: ChannelStatus) -> bool {
        self.send(FeedMessage::Status(status)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// External push channel scoped to one subject.
#[async_trait]
pub trait ChangeFeedProvider: Send + Sync {
    /// Start a subscription. The handshake outcome arrives later as a
    /// [`ChannelStatus`] through `sink`. The future may be dropped mid-call
    /// when the attempt is abandoned.
    async fn subscribe(
        &self,
        subject: &SubjectId,
        sink: FeedSink,
    ) -> SyncResult<SubscriptionHandle>;

    /// Release a subscription. Must tolerate handles that already failed.
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// Provider for deployments without a push channel: every attempt fails,
/// so the engine settles into polling.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableFeed;

#[async_trait]
impl ChangeFeedProvider for UnavailableFeed {
    async fn subscribe(
        &self,
        _subject: &SubjectId,
        _sink: FeedSink,
    ) -> SyncResult<SubscriptionHandle> {
        Err(SyncError::Subscription("push channel not configured".into()))
    }

    async fn unsubscribe(&self, _handle: SubscriptionHandle) {}
}

/// The live subscription attempt.
#[derive(Debug)]
struct Attempt {
    generation: u64,
    /// Aborts the pending `subscribe` call.
    cancel: CancellationToken,
    /// Set once the provider returned a handle.
    handle: Option<SubscriptionHandle>,
}

/// Owns at most one live subscription and its handshake/retry timers.
pub struct ChangeFeedClient {
    provider: Arc<dyn ChangeFeedProvider>,
    tx: mpsc::Sender<Command>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    handshake_timeout: Duration,
    retry_delay: Duration,
    state: ConnectionState,
    generation: u64,
    active: Option<Attempt>,
    handshake_deadline: Option<Instant>,
    retry_at: Option<Instant>,
}

impl ChangeFeedClient {
    pub(crate) fn new(
        provider: Arc<dyn ChangeFeedProvider>,
        tx: mpsc::Sender<Command>,
        tracker: TaskTracker,
        cancel: CancellationToken,
        handshake_timeout: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            provider,
            tx,
            tracker,
            cancel,
            handshake_timeout,
            retry_delay,
            state: ConnectionState::Closed,
            generation: 0,
            active: None,
            handshake_deadline: None,
            retry_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether an attempt is live, handle or not.
    pub fn has_subscription(&self) -> bool {
        self.active.is_some()
    }

    /// Whether messages stamped with `generation` belong to the live attempt.
    pub fn is_current(&self, generation: u64) -> bool {
        matches!(&self.active, Some(a) if a.generation == generation)
    }

    pub fn handshake_deadline(&self) -> Option<Instant> {
        self.handshake_deadline
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn clear_retry(&mut self) {
        self.retry_at = None;
    }

    /// Subscribe unless the circuit is open; with an open circuit, make sure
    /// polling carries the load instead. Returns whether an attempt started.
    pub fn open(
        &mut self,
        subject: &SubjectId,
        monitor: &ReliabilityMonitor,
        fallback: &mut PollingFallback,
    ) -> bool {
        if monitor.is_circuit_open() {
            fallback.start();
            self.mark_degraded();
            return false;
        }
        self.connect(subject);
        true
    }

    /// Start a new attempt unconditionally. Used directly for half-open trials.
    ///
    /// The handshake window covers both the `subscribe` call and the
    /// `Subscribed` status that must follow it.
    pub fn connect(&mut self, subject: &SubjectId) {
        self.release();
        self.retry_at = None;
        self.generation += 1;
        let generation = self.generation;
        if self.state != ConnectionState::Degraded {
            self.state = ConnectionState::Connecting;
        }

        debug!(subject = %subject, generation, "opening change feed subscription");
        let attempt_cancel = self.cancel.child_token();
        self.active = Some(Attempt {
            generation,
            cancel: attempt_cancel.clone(),
            handle: None,
        });
        self.handshake_deadline = Some(Instant::now() + self.handshake_timeout);

        self.tracker.spawn(run_subscribe(
            self.provider.clone(),
            subject.clone(),
            FeedSink::new(generation, self.tx.clone()),
            self.tx.clone(),
            attempt_cancel,
            self.handshake_timeout,
        ));
    }

    /// A `subscribe` call finished. Returns the error if the live attempt was
    /// refused; handles for released attempts are given back to the provider.
    pub(crate) fn attach(
        &mut self,
        generation: u64,
        outcome: SyncResult<SubscriptionHandle>,
    ) -> SyncResult<()> {
        if !self.is_current(generation) {
            if let Ok(handle) = outcome {
                debug!(generation, "subscribe finished after release");
                self.release_handle(generation, handle);
            }
            return Ok(());
        }
        let handle = outcome?;
        debug!(generation, handle = handle.id(), "subscription handle attached");
        if let Some(attempt) = self.active.as_mut() {
            attempt.handle = Some(handle);
        }
        Ok(())
    }

    /// Handshake finished for the live attempt.
    pub fn mark_subscribed(&mut self) {
        self.handshake_deadline = None;
        self.retry_at = None;
        self.state = ConnectionState::Subscribed;
    }

    pub fn mark_degraded(&mut self) {
        self.retry_at = None;
        self.state = ConnectionState::Degraded;
    }

    /// Re-subscribe after `retry_delay`.
    pub fn schedule_retry(&mut self) {
        self.retry_at = Some(Instant::now() + self.retry_delay);
        self.state = ConnectionState::Connecting;
    }

    /// Drop the live attempt, if any, keeping the current state.
    pub fn release(&mut self) {
        self.handshake_deadline = None;
        let Some(attempt) = self.active.take() else {
            return;
        };
        attempt.cancel.cancel();
        if let Some(handle) = attempt.handle {
            self.release_handle(attempt.generation, handle);
        }
    }

    /// Unsubscribe `handle` on a tracked task bounded by the handshake timeout.
    pub(crate) fn release_handle(&self, generation: u64, handle: SubscriptionHandle) {
        debug!(generation, handle = handle.id(), "releasing change feed subscription");
        self.tracker.spawn(run_unsubscribe(
            self.provider.clone(),
            handle,
            generation,
            self.handshake_timeout,
        ));
    }

    /// Release everything and return to `Closed`. Safe from any state.
    pub fn close(&mut self) {
        self.release();
        self.retry_at = None;
        self.state = ConnectionState::Closed;
    }
}

impl Drop for ChangeFeedClient {
    /// Covers exits that skip `close`, such as an unwinding dispatch loop.
    fn drop(&mut self) {
        if self.active.is_none() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            self.release();
        } else if let Some(attempt) = self.active.take() {
            attempt.cancel.cancel();
            warn!(generation = attempt.generation, "no runtime left to release subscription");
        }
    }
}

async fn run_subscribe(
    provider: Arc<dyn ChangeFeedProvider>,
    subject: SubjectId,
    sink: FeedSink,
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    unsubscribe_within: Duration,
) {
    let generation = sink.generation();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(generation, "subscribe abandoned");
            return;
        }
        outcome = provider.subscribe(&subject, sink) => outcome,
    };

    if cancel.is_cancelled() {
        if let Ok(handle) = outcome {
            run_unsubscribe(provider, handle, generation, unsubscribe_within).await;
        }
        return;
    }

    // A closed queue hands the command back; the handle must not leak.
    let attached = Command::Attached {
        generation,
        outcome,
    };
    if let Err(mpsc::error::SendError(Command::Attached {
        outcome: Ok(handle),
        ..
    })) = tx.send(attached).await
    {
        run_unsubscribe(provider, handle, generation, unsubscribe_within).await;
    }
}

async fn run_unsubscribe(
    provider: Arc<dyn ChangeFeedProvider>,
    handle: SubscriptionHandle,
    generation: u64,
    within: Duration,
) {
    if tokio::time::timeout(within, provider.unsubscribe(handle))
        .await
        .is_err()
    {
        warn!(generation, "unsubscribe did not finish in time; dropping handle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Accepts every subscription and counts live ones.
    #[derive(Default)]
    struct CountingFeed {
        next: AtomicU64,
        live: AtomicUsize,
    }

    impl CountingFeed {
        fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChangeFeedProvider for CountingFeed {
        async fn subscribe(
            &self,
            _subject: &SubjectId,
            sink: FeedSink,
        ) -> SyncResult<SubscriptionHandle> {
            self.live.fetch_add(1, Ordering::SeqCst);
            sink.try_send(FeedMessage::Status(ChannelStatus::Subscribed));
            Ok(SubscriptionHandle::new(self.next.fetch_add(1, Ordering::SeqCst)))
        }

        async fn unsubscribe(&self, _handle: SubscriptionHandle) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Never answers the subscribe call.
    struct HangingFeed;

    #[async_trait]
    impl ChangeFeedProvider for HangingFeed {
        async fn subscribe(
            &self,
            _subject: &SubjectId,
            _sink: FeedSink,
        ) -> SyncResult<SubscriptionHandle> {
            std::future::pending().await
        }

        async fn unsubscribe(&self, _handle: SubscriptionHandle) {}
    }

    struct Fixture {
        client: ChangeFeedClient,
        rx: mpsc::Receiver<Command>,
        tracker: TaskTracker,
    }

    fn fixture(provider: Arc<dyn ChangeFeedProvider>, handshake: Duration) -> Fixture {
        let (tx, rx) = mpsc::channel(16);
        let tracker = TaskTracker::new();
        let client = ChangeFeedClient::new(
            provider,
            tx,
            tracker.clone(),
            CancellationToken::new(),
            handshake,
            Duration::from_millis(10),
        );
        Fixture {
            client,
            rx,
            tracker,
        }
    }

    impl Fixture {
        /// Feed every `Attached` back into the client; return everything else.
        async fn pump(&mut self) -> Vec<Command> {
            let mut others = Vec::new();
            while let Ok(Some(command)) =
                tokio::time::timeout(Duration::from_millis(50), self.rx.recv()).await
            {
                match command {
                    Command::Attached {
                        generation,
                        outcome,
                    } => {
                        let _ = self.client.attach(generation, outcome);
                    }
                    other => others.push(other),
                }
            }
            others
        }

        /// Wait for every tracked feed task to finish.
        async fn settle(&self) {
            self.tracker.close();
            tokio::time::timeout(Duration::from_secs(2), self.tracker.wait())
                .await
                .expect("tracked feed tasks should finish");
            self.tracker.reopen();
        }
    }

    #[tokio::test]
    async fn connect_keeps_a_single_subscription() {
        let feed = Arc::new(CountingFeed::default());
        let mut f = fixture(feed.clone(), Duration::from_secs(15));
        let subject = SubjectId::new("s1");

        f.client.connect(&subject);
        f.pump().await;
        f.client.connect(&subject);
        f.pump().await;
        f.settle().await;

        assert_eq!(feed.live(), 1);
        assert_eq!(f.client.generation(), 2);
        assert!(f.client.is_current(2));
        assert!(!f.client.is_current(1));
        assert_eq!(f.client.state(), ConnectionState::Connecting);
        assert!(f.client.handshake_deadline().is_some());
    }

    #[tokio::test]
    async fn sink_messages_carry_the_attempt_generation() {
        let feed = Arc::new(CountingFeed::default());
        let mut f = fixture(feed, Duration::from_secs(15));
        f.client.connect(&SubjectId::new("s1"));

        let others = f.pump().await;
        match others.as_slice() {
            [Command::Feed {
                generation,
                message: FeedMessage::Status(ChannelStatus::Subscribed),
            }] => assert_eq!(*generation, 1),
            other => panic!("unexpected commands: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_safe_from_every_state() {
        let feed = Arc::new(CountingFeed::default());
        let mut f = fixture(feed.clone(), Duration::from_secs(15));

        f.client.close();
        assert_eq!(f.client.state(), ConnectionState::Closed);

        f.client.connect(&SubjectId::new("s1"));
        f.pump().await;
        f.client.mark_subscribed();
        f.client.close();
        f.client.close();
        f.settle().await;

        assert_eq!(feed.live(), 0);
        assert!(!f.client.has_subscription());
        assert_eq!(f.client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn close_mid_handshake_abandons_the_pending_subscribe() {
        let mut f = fixture(Arc::new(HangingFeed), Duration::from_secs(15));
        f.client.connect(&SubjectId::new("s1"));
        assert_eq!(f.tracker.len(), 1);

        f.client.close();
        f.settle().await;
        assert!(f.tracker.is_empty());
        assert!(f.pump().await.is_empty());
    }

    #[tokio::test]
    async fn handle_for_a_released_attempt_is_unsubscribed() {
        let feed = Arc::new(CountingFeed::default());
        let mut f = fixture(feed.clone(), Duration::from_secs(15));
        let subject = SubjectId::new("s1");

        f.client.connect(&subject);
        // First subscribe completes, its handle still queued.
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.client.connect(&subject);
        f.pump().await;
        f.settle().await;

        assert_eq!(feed.live(), 1);
        assert!(f.client.is_current(2));
    }

    #[tokio::test]
    async fn refused_subscribe_reports_the_error() {
        let mut f = fixture(Arc::new(UnavailableFeed), Duration::from_secs(1));
        f.client.connect(&SubjectId::new("s1"));

        let command = tokio::time::timeout(Duration::from_secs(1), f.rx.recv())
            .await
            .unwrap()
            .unwrap();
        match command {
            Command::Attached {
                generation,
                outcome,
            } => {
                let err = f.client.attach(generation, outcome).unwrap_err();
                assert!(matches!(err, SyncError::Subscription(_)));
            }
            other => panic!("expected attach outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_the_client_releases_its_subscription() {
        let feed = Arc::new(CountingFeed::default());
        let mut f = fixture(feed.clone(), Duration::from_secs(15));
        f.client.connect(&SubjectId::new("s1"));
        f.pump().await;
        assert_eq!(feed.live(), 1);

        let Fixture { client, tracker, .. } = f;
        drop(client);
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .unwrap();
        assert_eq!(feed.live(), 0);
    }

    #[tokio::test]
    async fn retry_moves_back_to_connecting() {
        let feed = Arc::new(CountingFeed::default());
        let mut f = fixture(feed, Duration::from_secs(15));
        f.client.mark_degraded();
        assert_eq!(f.client.state(), ConnectionState::Degraded);
        f.client.schedule_retry();
        assert_eq!(f.client.state(), ConnectionState::Connecting);
        assert!(f.client.retry_at().is_some());
    }
}
