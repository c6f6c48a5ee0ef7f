use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::model::{
    api::session::SessionUpdate,
    common::ParticipantId,
    db::{
        session::{NewSession, Session},
        vote::{InsertOutcome, VoteRecord},
    },
    mongodb::Id,
};

use super::{LedgerTally, SessionStore, VoteLedger};

type LedgerKey = (Id, String, String, String);

#[derive(Default)]
struct Inner {
    sessions: BTreeMap<Id, Session>,
    votes: Vec<VoteRecord>,
    vote_keys: HashSet<LedgerKey>,
    #[cfg(test)]
    failing_options: HashSet<(String, String)>,
    #[cfg(test)]
    offline: bool,
}

/// An in-process store with the same uniqueness rules as the MongoDB one.
/// Cloning gives another handle onto the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::Unavailable("memory store poisoned".to_string()))?;
        #[cfg(test)]
        if inner.offline {
            return Err(Error::Unavailable("memory store offline".to_string()));
        }
        Ok(inner)
    }

    /// A copy of every ledger record, in insertion order.
    pub fn votes(&self) -> Result<Vec<VoteRecord>> {
        Ok(self.lock()?.votes.clone())
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Make every increment of the given option fail.
    pub fn fail_increments_for(&self, question_id: &str, option_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_options
            .insert((question_id.to_string(), option_id.to_string()));
    }

    /// Make every operation fail as if the store were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().unwrap().offline = offline;
    }
}

#[rocket::async_trait]
impl SessionStore for MemoryStore {
    async fn find_by_join_code(&self, join_code: &str) -> Result<Option<Session>> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .find(|s| s.join_code == join_code)
            .cloned())
    }

    async fn find_by_id(&self, id: Id) -> Result<Option<Session>> {
        Ok(self.lock()?.sessions.get(&id).cloned())
    }

    async fn increment_option_votes(
        &self,
        session_id: Id,
        question_id: &str,
        option_id: &str,
        delta: u64,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        #[cfg(test)]
        if inner
            .failing_options
            .contains(&(question_id.to_string(), option_id.to_string()))
        {
            return Err(Error::Unavailable(format!(
                "increment of {question_id}/{option_id} refused"
            )));
        }
        if let Some(option) = inner
            .sessions
            .get_mut(&session_id)
            .and_then(|s| s.question_mut(question_id))
            .and_then(|q| q.option_mut(option_id))
        {
            option.votes = option.votes.saturating_add(delta);
        }
        Ok(())
    }

    async fn increment_participant_count(&self, session_id: Id, delta: u64) -> Result<()> {
        if let Some(session) = self.lock()?.sessions.get_mut(&session_id) {
            let count = &mut session.analytics.total_participants;
            *count = count.saturating_add(delta);
        }
        Ok(())
    }

    async fn insert_session(&self, session: &NewSession) -> Result<Option<Session>> {
        let mut inner = self.lock()?;
        if inner
            .sessions
            .values()
            .any(|s| s.join_code == session.join_code)
        {
            return Ok(None);
        }
        let session = Session {
            id: Id::new(),
            session: session.clone(),
        };
        inner.sessions.insert(session.id, session.clone());
        Ok(Some(session))
    }

    async fn list_active(&self) -> Result<Vec<Session>> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }

    async fn update_session(&self, id: Id, update: &SessionUpdate) -> Result<Option<Session>> {
        let mut inner = self.lock()?;
        let session = match inner.sessions.get_mut(&id) {
            Some(session) => session,
            None => return Ok(None),
        };
        if let Some(ref title) = update.title {
            session.title = title.clone();
        }
        if let Some(is_active) = update.is_active {
            session.is_active = is_active;
        }
        Ok(Some(session.clone()))
    }

    async fn overwrite_counters(&self, id: Id, tally: &LedgerTally) -> Result<Option<Session>> {
        let mut inner = self.lock()?;
        let session = match inner.sessions.get_mut(&id) {
            Some(session) => session,
            None => return Ok(None),
        };
        for question in session.questions.iter_mut() {
            for option in question.options.iter_mut() {
                option.votes = tally.votes_for(&question.id, &option.id);
            }
        }
        session.analytics.total_participants = tally.participants;
        Ok(Some(session.clone()))
    }
}

#[rocket::async_trait]
impl VoteLedger for MemoryStore {
    async fn insert_votes(&self, records: &[VoteRecord]) -> Result<Vec<InsertOutcome>> {
        let mut inner = self.lock()?;
        let outcomes = records
            .iter()
            .map(|record| {
                let (session_id, question_id, participant_id, slot) = record.unique_key();
                let key = (
                    session_id,
                    question_id.to_string(),
                    participant_id.to_string(),
                    slot.to_string(),
                );
                if inner.vote_keys.insert(key) {
                    inner.votes.push(record.clone());
                    InsertOutcome::Inserted
                } else {
                    InsertOutcome::Duplicate
                }
            })
            .collect();
        Ok(outcomes)
    }

    async fn has_voted(
        &self,
        session_id: Id,
        question_id: &str,
        participant_id: &ParticipantId,
    ) -> Result<bool> {
        Ok(self.lock()?.votes.iter().any(|v| {
            v.session_id == session_id
                && v.question_id == question_id
                && &v.participant_id == participant_id
        }))
    }

    async fn has_voted_option(
        &self,
        session_id: Id,
        question_id: &str,
        option_id: &str,
        participant_id: &ParticipantId,
    ) -> Result<bool> {
        Ok(self.lock()?.votes.iter().any(|v| {
            v.session_id == session_id
                && v.question_id == question_id
                && v.option_id == option_id
                && &v.participant_id == participant_id
        }))
    }

    async fn has_any_vote(&self, session_id: Id, participant_id: &ParticipantId) -> Result<bool> {
        Ok(self
            .lock()?
            .votes
            .iter()
            .any(|v| v.session_id == session_id && &v.participant_id == participant_id))
    }

    async fn tally(&self, session_id: Id) -> Result<LedgerTally> {
        let inner = self.lock()?;
        let mut tally = LedgerTally::default();
        let mut participants = HashSet::new();
        for vote in inner.votes.iter().filter(|v| v.session_id == session_id) {
            *tally
                .votes
                .entry((vote.question_id.clone(), vote.option_id.clone()))
                .or_default() += 1;
            participants.insert(vote.participant_id.clone());
        }
        tally.participants = participants.len() as u64;
        Ok(tally)
    }
}
