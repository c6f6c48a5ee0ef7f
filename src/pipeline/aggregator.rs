use std::collections::{BTreeMap, HashSet};
use std::ops::AddAssign;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rocket::tokio::{sync::Mutex as AsyncMutex, time::Duration};

use crate::model::{
    common::{OptionId, ParticipantId, QuestionId},
    mongodb::Id,
};
use crate::scheduled_task::ScheduledTask;
use crate::storage::SessionStore;

use super::queue::{AggregationEvent, AggregationQueue, Appended};

/// Default delay between the first vote of a burst and its drain.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

/// Counter an aggregation group increments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptionKey {
    pub session_id: Id,
    pub question_id: QuestionId,
    pub option_id: OptionId,
}

/// A drained queue snapshot, coalesced into per-counter increments.
#[derive(Debug, Default)]
pub struct Batch {
    pub events: usize,
    pub option_counts: BTreeMap<OptionKey, u64>,
    pub first_voters: BTreeMap<Id, HashSet<ParticipantId>>,
}

impl Batch {
    pub fn coalesce(events: impl IntoIterator<Item = AggregationEvent>) -> Self {
        let mut batch = Self::default();
        for event in events {
            batch.events += 1;
            if event.first_vote_for_session {
                batch
                    .first_voters
                    .entry(event.session_id)
                    .or_default()
                    .insert(event.participant_id);
            }
            let key = OptionKey {
                session_id: event.session_id,
                question_id: event.question_id,
                option_id: event.option_id,
            };
            *batch.option_counts.entry(key).or_default() += 1;
        }
        batch
    }

    /// Apply every group as one atomic increment.
    /// Failed groups are logged and dropped; the ledger still has their votes.
    pub async fn apply(self, sessions: &dyn SessionStore) -> DrainReport {
        let mut report = DrainReport {
            events: self.events,
            ..Default::default()
        };

        for (key, count) in self.option_counts {
            match sessions
                .increment_option_votes(key.session_id, &key.question_id, &key.option_id, count)
                .await
            {
                Ok(()) => report.groups_applied += 1,
                Err(e) => {
                    error!(
                        "Dropping +{count} for option {}/{} of session {}: {e}",
                        key.question_id, key.option_id, key.session_id
                    );
                    report.groups_dropped += 1;
                }
            }
        }

        for (session_id, participants) in self.first_voters {
            let delta = participants.len() as u64;
            match sessions
                .increment_participant_count(session_id, delta)
                .await
            {
                Ok(()) => report.participants_added += delta,
                Err(e) => {
                    error!("Dropping +{delta} participants for session {session_id}: {e}");
                    report.groups_dropped += 1;
                }
            }
        }

        report
    }
}

/// What a drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub events: usize,
    pub groups_applied: usize,
    pub groups_dropped: usize,
    pub participants_added: u64,
}

impl AddAssign for DrainReport {
    fn add_assign(&mut self, rhs: Self) {
        self.events += rhs.events;
        self.groups_applied += rhs.groups_applied;
        self.groups_dropped += rhs.groups_dropped;
        self.participants_added += rhs.participants_added;
    }
}

struct Inner {
    queue: AggregationQueue,
    sessions: Arc<dyn SessionStore>,
    delay: Duration,
    /// The most recently scheduled drain.
    pending: Mutex<Option<ScheduledTask<DrainReport>>>,
    /// Held for the whole of a drain, so drains never overlap.
    draining: AsyncMutex<()>,
}

impl Inner {
    async fn drain(&self) -> DrainReport {
        let _draining = self.draining.lock().await;
        let events = self.queue.take();
        if events.is_empty() {
            return DrainReport::default();
        }

        let report = Batch::coalesce(events).apply(self.sessions.as_ref()).await;
        debug!(
            "Drained {} votes: {} groups applied, {} dropped, {} new participants",
            report.events, report.groups_applied, report.groups_dropped, report.participants_added
        );
        report
    }

    fn pending(&self) -> MutexGuard<'_, Option<ScheduledTask<DrainReport>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Batches accepted votes and applies them to the session counters.
///
/// Idle until votes arrive; the first vote of a burst schedules a single
/// drain `delay` later, and everything queued by then is applied together.
/// Cloning gives another handle onto the same aggregator.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    pub fn new(sessions: Arc<dyn SessionStore>, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: AggregationQueue::new(),
                sessions,
                delay,
                pending: Mutex::new(None),
                draining: AsyncMutex::new(()),
            }),
        }
    }

    /// Queue events for aggregation. Must be called from within the runtime.
    ///
    /// Returns the number of events queued, which is zero once the
    /// aggregator has been shut down.
    pub fn submit(&self, events: Vec<AggregationEvent>) -> usize {
        let count = events.len();
        match self.inner.queue.push(events) {
            Appended::Closed => {
                warn!("Aggregator stopped, {count} votes left to reconciliation");
                0
            }
            Appended::Scheduled => {
                self.schedule();
                count
            }
            Appended::Queued => count,
        }
    }

    fn schedule(&self) {
        let inner = self.inner.clone();
        let task = ScheduledTask::after(async move { inner.drain().await }, self.inner.delay);
        *self.inner.pending() = Some(task);
    }

    /// Run any scheduled drain now and wait for every queued event to be applied.
    pub async fn flush(&self) -> DrainReport {
        let pending = self.inner.pending().take();
        let mut report = DrainReport::default();
        if let Some(task) = pending {
            task.trigger_now();
            match task.await {
                Ok(drained) => report += drained,
                Err(e) => error!("Scheduled drain failed: {e}"),
            }
        }
        // Waits out any drain still in flight from an older timer, then
        // takes whatever was queued while a drain was being scheduled.
        report += self.inner.drain().await;
        report
    }

    /// Stop accepting events and apply everything still queued.
    pub async fn shutdown(&self) -> DrainReport {
        // Closed under the queue lock: anything pushed before this is
        // drained below, anything after is refused.
        self.inner.queue.close();
        let report = self.flush().await;
        info!("Aggregator stopped after flushing {} votes", report.events);
        report
    }

    /// Number of events waiting for a drain.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.queue.is_scheduled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rocket::tokio::time::sleep;

    use crate::error::Result;
    use crate::model::{
        api::session::SessionUpdate,
        db::session::{NewSession, Session, SessionCore},
    };
    use crate::pipeline::queue::event;
    use crate::storage::{LedgerTally, MemoryStore};

    /// Records every counter increment before passing it on.
    #[derive(Default)]
    struct RecordingStore {
        store: MemoryStore,
        increments: Mutex<Vec<(String, String, u64)>>,
        /// Simulated round trip for each increment.
        latency: Duration,
    }

    #[rocket::async_trait]
    impl SessionStore for RecordingStore {
        async fn find_by_join_code(&self, join_code: &str) -> Result<Option<Session>> {
            self.store.find_by_join_code(join_code).await
        }

        async fn find_by_id(&self, id: Id) -> Result<Option<Session>> {
            self.store.find_by_id(id).await
        }

        async fn increment_option_votes(
            &self,
            session_id: Id,
            question_id: &str,
            option_id: &str,
            delta: u64,
        ) -> Result<()> {
            self.increments.lock().unwrap().push((
                question_id.to_string(),
                option_id.to_string(),
                delta,
            ));
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }
            self.store
                .increment_option_votes(session_id, question_id, option_id, delta)
                .await
        }

        async fn increment_participant_count(&self, session_id: Id, delta: u64) -> Result<()> {
            self.store
                .increment_participant_count(session_id, delta)
                .await
        }

        async fn insert_session(&self, session: &NewSession) -> Result<Option<Session>> {
            self.store.insert_session(session).await
        }

        async fn list_active(&self) -> Result<Vec<Session>> {
            self.store.list_active().await
        }

        async fn update_session(&self, id: Id, update: &SessionUpdate) -> Result<Option<Session>> {
            self.store.update_session(id, update).await
        }

        async fn overwrite_counters(&self, id: Id, tally: &LedgerTally) -> Result<Option<Session>> {
            self.store.overwrite_counters(id, tally).await
        }
    }

    async fn setup(delay: Duration) -> (Arc<RecordingStore>, Aggregator, Session) {
        setup_with(RecordingStore::default(), delay).await
    }

    async fn setup_with(
        store: RecordingStore,
        delay: Duration,
    ) -> (Arc<RecordingStore>, Aggregator, Session) {
        let store = Arc::new(store);
        let session = store
            .insert_session(&SessionCore::example())
            .await
            .unwrap()
            .unwrap();
        let aggregator = Aggregator::new(store.clone(), delay);
        (store, aggregator, session)
    }

    async fn votes(store: &RecordingStore, session: Id, question: &str, option: &str) -> u64 {
        let session = store.find_by_id(session).await.unwrap().unwrap();
        session.question(question).unwrap().option(option).unwrap().votes
    }

    #[test]
    fn coalesces_repeated_keys() {
        let session = Id::new();
        let batch = Batch::coalesce(vec![
            event(session, "q1", "a", "p1", true),
            event(session, "q1", "a", "p2", true),
            event(session, "q1", "a", "p3", false),
            event(session, "q2", "x", "p1", true),
        ]);
        assert_eq!(batch.events, 4);
        assert_eq!(batch.option_counts.len(), 2);
        let a = OptionKey {
            session_id: session,
            question_id: "q1".to_string(),
            option_id: "a".to_string(),
        };
        assert_eq!(batch.option_counts[&a], 3);
        // p1 voted twice as a first voter but counts once.
        assert_eq!(batch.first_voters[&session].len(), 2);
    }

    #[rocket::async_test]
    async fn one_increment_per_group() {
        let (store, aggregator, session) = setup(Duration::from_secs(3600)).await;
        aggregator.submit(vec![
            event(session.id, "q1", "a", "p1", true),
            event(session.id, "q1", "a", "p2", true),
            event(session.id, "q1", "a", "p3", true),
        ]);
        let report = aggregator.flush().await;

        assert_eq!(report.events, 3);
        assert_eq!(report.groups_applied, 1);
        assert_eq!(report.participants_added, 3);
        assert_eq!(
            *store.increments.lock().unwrap(),
            vec![("q1".to_string(), "a".to_string(), 3)]
        );
        assert_eq!(votes(&store, session.id, "q1", "a").await, 3);
    }

    #[rocket::async_test]
    async fn empty_drain_is_a_noop() {
        let (store, aggregator, _) = setup(DEFAULT_DELAY).await;
        assert_eq!(aggregator.flush().await, DrainReport::default());
        assert!(store.increments.lock().unwrap().is_empty());
    }

    #[rocket::async_test]
    async fn drains_after_the_delay_without_intervention() {
        let (store, aggregator, session) = setup(Duration::from_millis(20)).await;
        aggregator.submit(vec![event(session.id, "q2", "x", "p1", true)]);
        aggregator.submit(vec![event(session.id, "q2", "y", "p1", true)]);
        assert!(aggregator.is_scheduled());
        assert_eq!(aggregator.queued(), 2);

        sleep(Duration::from_millis(300)).await;

        assert!(!aggregator.is_scheduled());
        assert_eq!(aggregator.queued(), 0);
        assert_eq!(votes(&store, session.id, "q2", "x").await, 1);
        assert_eq!(votes(&store, session.id, "q2", "y").await, 1);
        let session = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(session.analytics.total_participants, 1);
    }

    #[rocket::async_test]
    async fn later_bursts_schedule_their_own_drain() {
        let (store, aggregator, session) = setup(Duration::from_millis(20)).await;
        aggregator.submit(vec![event(session.id, "q1", "a", "p1", true)]);
        sleep(Duration::from_millis(200)).await;
        aggregator.submit(vec![event(session.id, "q1", "b", "p2", true)]);
        assert!(aggregator.is_scheduled());
        sleep(Duration::from_millis(200)).await;

        assert_eq!(votes(&store, session.id, "q1", "a").await, 1);
        assert_eq!(votes(&store, session.id, "q1", "b").await, 1);
        assert_eq!(store.increments.lock().unwrap().len(), 2);
    }

    #[rocket::async_test]
    async fn failed_group_is_dropped_and_others_applied() {
        let (store, aggregator, session) = setup(Duration::from_secs(3600)).await;
        store.store.fail_increments_for("q2", "x");
        aggregator.submit(vec![
            event(session.id, "q2", "x", "p1", true),
            event(session.id, "q2", "y", "p1", true),
        ]);
        let report = aggregator.flush().await;

        assert_eq!(report.groups_applied, 1);
        assert_eq!(report.groups_dropped, 1);
        assert_eq!(votes(&store, session.id, "q2", "x").await, 0);
        assert_eq!(votes(&store, session.id, "q2", "y").await, 1);
        // Not requeued.
        assert_eq!(aggregator.queued(), 0);
        assert_eq!(aggregator.flush().await, DrainReport::default());
    }

    #[rocket::async_test]
    async fn shutdown_flushes_and_stops() {
        let (store, aggregator, session) = setup(Duration::from_secs(3600)).await;
        aggregator.submit(vec![event(session.id, "q1", "b", "p1", true)]);
        let report = aggregator.shutdown().await;
        assert_eq!(report.events, 1);
        assert_eq!(votes(&store, session.id, "q1", "b").await, 1);

        assert_eq!(
            aggregator.submit(vec![event(session.id, "q1", "b", "p2", true)]),
            0
        );
        assert_eq!(aggregator.queued(), 0);
    }

    #[rocket::async_test]
    async fn submits_racing_shutdown_are_applied_or_refused() {
        let (store, aggregator, session) = setup(Duration::from_millis(1)).await;
        let submitters: Vec<_> = (0..8)
            .map(|t| {
                let aggregator = aggregator.clone();
                let session_id = session.id;
                rocket::tokio::spawn(async move {
                    let mut accepted = 0;
                    for i in 0..50 {
                        let participant = format!("{t}-{i}");
                        accepted += aggregator
                            .submit(vec![event(session_id, "q1", "a", &participant, false)]);
                        rocket::tokio::task::yield_now().await;
                    }
                    accepted
                })
            })
            .collect();

        sleep(Duration::from_millis(2)).await;
        aggregator.shutdown().await;
        let mut accepted = 0;
        for submitter in submitters {
            accepted += submitter.await.unwrap();
        }

        // Everything accepted before the close was applied by the shutdown.
        assert_eq!(votes(&store, session.id, "q1", "a").await as usize, accepted);
        assert_eq!(aggregator.queued(), 0);
    }

    #[rocket::async_test]
    async fn overlapping_drains_count_each_event_once() {
        let store = RecordingStore {
            latency: Duration::from_millis(15),
            ..Default::default()
        };
        let (store, aggregator, session) = setup_with(store, Duration::from_millis(5)).await;

        let mut submitted = 0;
        for round in 0..4 {
            let burst = |offset: usize| {
                (0..10)
                    .map(|i| {
                        let option = if i % 2 == 0 { "a" } else { "b" };
                        let participant = format!("{round}-{offset}-{i}");
                        event(session.id, "q1", option, &participant, false)
                    })
                    .collect::<Vec<_>>()
            };
            submitted += aggregator.submit(burst(0));
            // Flushes race each other, the timer-fired drain, and a burst
            // arriving mid-drain.
            let (_, _, late) = rocket::tokio::join!(aggregator.flush(), aggregator.flush(), async {
                sleep(Duration::from_millis(5)).await;
                aggregator.submit(burst(1))
            });
            submitted += late;
        }
        aggregator.flush().await;
        // Let any timer scheduled by the last burst fire on the empty queue.
        sleep(Duration::from_millis(50)).await;

        let counted = votes(&store, session.id, "q1", "a").await
            + votes(&store, session.id, "q1", "b").await;
        assert_eq!(counted as usize, submitted);
        let increments: u64 = store
            .increments
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, delta)| delta)
            .sum();
        assert_eq!(increments as usize, submitted);
    }
}
