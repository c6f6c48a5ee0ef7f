//! The persistence contract the polling core depends on.
//!
//! [`SessionStore`] holds sessions and their aggregate counters, [`VoteLedger`]
//! holds individual votes. Both are object-safe so the server can run over
//! MongoDB in production and over [`MemoryStore`] in tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{
    api::session::SessionUpdate,
    common::{OptionId, ParticipantId, QuestionId},
    db::{
        session::{NewSession, Session},
        vote::{InsertOutcome, VoteRecord},
    },
    mongodb::Id,
};

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

#[cfg(test)]
pub(crate) use mongo::test_database;

/// Session lookup, aggregate counters, and the thin session CRUD around them.
#[rocket::async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_by_join_code(&self, join_code: &str) -> Result<Option<Session>>;

    async fn find_by_id(&self, id: Id) -> Result<Option<Session>>;

    /// Atomically add `delta` to an option's vote counter without reading it.
    /// Succeeds without effect if the option does not exist.
    async fn increment_option_votes(
        &self,
        session_id: Id,
        question_id: &str,
        option_id: &str,
        delta: u64,
    ) -> Result<()>;

    /// Atomically add `delta` to a session's participant counter.
    async fn increment_participant_count(&self, session_id: Id, delta: u64) -> Result<()>;

    /// Insert a new session. Returns `None` if its join code is already taken.
    async fn insert_session(&self, session: &NewSession) -> Result<Option<Session>>;

    /// All sessions currently accepting votes.
    async fn list_active(&self) -> Result<Vec<Session>>;

    /// Apply an organizer update, returning the updated session.
    async fn update_session(&self, id: Id, update: &SessionUpdate) -> Result<Option<Session>>;

    /// Replace all aggregate counters of a session with the given tally,
    /// in one update. Options absent from the tally are reset to zero.
    /// Increments racing this update may be lost.
    async fn overwrite_counters(&self, id: Id, tally: &LedgerTally) -> Result<Option<Session>>;
}

/// The durable record of individual votes.
#[rocket::async_trait]
pub trait VoteLedger: Send + Sync {
    /// Write all records, tolerating per-record failures.
    /// Returns one outcome per record, in order.
    async fn insert_votes(&self, records: &[VoteRecord]) -> Result<Vec<InsertOutcome>>;

    /// Has the participant voted on the question at all?
    async fn has_voted(
        &self,
        session_id: Id,
        question_id: &str,
        participant_id: &ParticipantId,
    ) -> Result<bool>;

    /// Has the participant already selected this exact option?
    async fn has_voted_option(
        &self,
        session_id: Id,
        question_id: &str,
        option_id: &str,
        participant_id: &ParticipantId,
    ) -> Result<bool>;

    /// Has the participant voted on anything in the session?
    async fn has_any_vote(&self, session_id: Id, participant_id: &ParticipantId) -> Result<bool>;

    /// Count the ledger for a session, for reconciliation.
    async fn tally(&self, session_id: Id) -> Result<LedgerTally>;
}

/// Per-option vote counts and distinct participants, as recorded by the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerTally {
    pub votes: BTreeMap<(QuestionId, OptionId), u64>,
    pub participants: u64,
}

impl LedgerTally {
    pub fn votes_for(&self, question_id: &str, option_id: &str) -> u64 {
        self.votes
            .get(&(question_id.to_string(), option_id.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// The storage backend in use, placed into managed state.
#[derive(Clone)]
pub struct Storage {
    pub sessions: Arc<dyn SessionStore>,
    pub ledger: Arc<dyn VoteLedger>,
}

impl Storage {
    pub fn mongo(store: MongoStore) -> Self {
        let store = Arc::new(store);
        Self {
            sessions: store.clone(),
            ledger: store,
        }
    }

    pub fn memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            sessions: store.clone(),
            ledger: store,
        }
    }
}
