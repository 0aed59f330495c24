use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::AttendanceRecord;
use crate::source::AttendanceSource;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub records: Vec<AttendanceRecord>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// In-memory attendance for one watched session. Every refresh swaps the
/// whole snapshot; readers never see a half-applied update.
#[derive(Clone)]
pub struct RecordStore {
    tx: Arc<watch::Sender<Arc<Snapshot>>>,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Snapshot::default()));
        Self { tx: Arc::new(tx) }
    }

    pub fn replace(&self, records: Vec<AttendanceRecord>) {
        self.tx.send_replace(Arc::new(Snapshot {
            records,
            refreshed_at: Some(Utc::now()),
        }));
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone)]
pub struct PollTarget {
    pub program: String,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
}

/// Handle to a running refresh loop. The loop is aborted when the handle is
/// stopped or dropped, so no refresh outlives its owner.
pub struct SessionPoller {
    handle: Option<JoinHandle<()>>,
}

impl SessionPoller {
    pub fn start(
        source: Arc<dyn AttendanceSource>,
        target: PollTarget,
        store: RecordStore,
        interval: Duration,
    ) -> Self {
        info!(
            program = %target.program,
            session = %target.session_id,
            interval_secs = interval.as_secs(),
            "polling started"
        );
        let handle = tokio::spawn(poll_loop(source, target, store, interval));
        Self {
            handle: Some(handle),
        }
    }

    pub fn state(&self) -> PollerState {
        match &self.handle {
            Some(handle) if !handle.is_finished() => PollerState::Polling,
            _ => PollerState::Idle,
        }
    }

    /// Cancels the loop and waits until it has fully wound down.
    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "poller task failed");
                }
            }
            info!("polling stopped");
        }
    }

    /// Resolves once the loop exits on its own, i.e. the session ended.
    pub async fn finished(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "poller task panicked");
                }
            }
            self.handle = None;
        }
    }
}

impl Drop for SessionPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn poll_loop(
    source: Arc<dyn AttendanceSource>,
    target: PollTarget,
    store: RecordStore,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match source.session_open(target.session_id).await {
            Ok(false) => {
                info!(session = %target.session_id, "session ended, polling stops");
                return;
            }
            Ok(true) => {}
            Err(e) => {
                warn!(error = %e, "session check failed, retrying next tick");
                continue;
            }
        }

        match source.todays_attendance(&target.program).await {
            Ok(records) => {
                debug!(count = records.len(), "attendance refreshed");
                store.replace(records);
            }
            Err(e) => warn!(error = %e, "attendance refresh failed, retrying next tick"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::sample_record;
    use crate::models::Role;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Default)]
    struct FakeSource {
        fetch_calls: AtomicU64,
        fail_every_other: bool,
        closed: AtomicBool,
    }

    impl FakeSource {
        fn fetches(&self) -> u64 {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AttendanceSource for FakeSource {
        async fn todays_attendance(
            &self,
            _program: &str,
        ) -> anyhow::Result<Vec<AttendanceRecord>> {
            let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every_other && call % 2 == 0 {
                anyhow::bail!("backend unavailable");
            }
            Ok(vec![sample_record(
                &format!("Trainee {call}"),
                Role::Student,
                1,
                1,
            )])
        }

        async fn session_open(&self, _session_id: Uuid) -> anyhow::Result<bool> {
            Ok(!self.closed.load(Ordering::SeqCst))
        }
    }

    fn target() -> PollTarget {
        PollTarget {
            program: "Data Engineering".to_string(),
            session_id: Uuid::new_v4(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_once_per_tick_and_nothing_after_stop() {
        let source = Arc::new(FakeSource::default());
        let store = RecordStore::new();
        let poller = SessionPoller::start(
            source.clone(),
            target(),
            store.clone(),
            DEFAULT_POLL_INTERVAL,
        );
        assert_eq!(poller.state(), PollerState::Polling);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(source.fetches(), 3);
        assert_eq!(store.snapshot().records[0].name, "Trainee 3");

        poller.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_poller_cancels_refreshes() {
        let source = Arc::new(FakeSource::default());
        let poller = SessionPoller::start(
            source.clone(),
            target(),
            RecordStore::new(),
            DEFAULT_POLL_INTERVAL,
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.fetches(), 1);

        drop(poller);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_previous_snapshot_and_keeps_polling() {
        let source = Arc::new(FakeSource {
            fail_every_other: true,
            ..FakeSource::default()
        });
        let store = RecordStore::new();
        let poller = SessionPoller::start(
            source.clone(),
            target(),
            store.clone(),
            DEFAULT_POLL_INTERVAL,
        );

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(source.fetches(), 2);
        assert_eq!(store.snapshot().records[0].name, "Trainee 1");
        assert_eq!(poller.state(), PollerState::Polling);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.snapshot().records[0].name, "Trainee 3");
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ended_session_returns_poller_to_idle() {
        let source = Arc::new(FakeSource::default());
        let mut poller = SessionPoller::start(
            source.clone(),
            target(),
            RecordStore::new(),
            DEFAULT_POLL_INTERVAL,
        );

        tokio::time::sleep(Duration::from_secs(12)).await;
        source.closed.store(true, Ordering::SeqCst);
        poller.finished().await;

        assert_eq!(poller.state(), PollerState::Idle);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_replacements() {
        let store = RecordStore::new();
        let mut rx = store.subscribe();
        assert!(store.snapshot().refreshed_at.is_none());

        store.replace(vec![sample_record("Avery Lee", Role::Student, 4, 5)]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().records.len(), 1);
        assert!(store.snapshot().refreshed_at.is_some());
    }
}
