use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::model::{
    common::{OptionId, ParticipantId, QuestionId},
    mongodb::Id,
};

/// An accepted vote on its way to the aggregate counters.
///
/// Events are an optimisation artifact: they are never persisted, and each
/// one is consumed by exactly one drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationEvent {
    pub session_id: Id,
    pub question_id: QuestionId,
    pub option_id: OptionId,
    pub participant_id: ParticipantId,
    /// The participant had no ledger records for the session when their
    /// request started.
    pub first_vote_for_session: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    events: Vec<AggregationEvent>,
    /// A drain has been scheduled and has not yet taken the events.
    scheduled: bool,
    /// No more events are accepted.
    closed: bool,
}

/// What became of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// Queued behind an already scheduled drain, or nothing to queue.
    Queued,
    /// First append of a burst: the caller must schedule the drain.
    Scheduled,
    /// The queue is closed and the events were discarded.
    Closed,
}

/// Buffer of accepted votes shared between all admission requests and the
/// aggregator. Appends and drains are mutually exclusive.
#[derive(Debug, Default)]
pub struct AggregationQueue {
    state: Mutex<QueueState>,
}

impl AggregationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state is valid after every statement, so a panic elsewhere
        // cannot leave it inconsistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append events to the queue, unless it has been closed.
    pub fn push(&self, events: impl IntoIterator<Item = AggregationEvent>) -> Appended {
        let mut state = self.lock();
        if state.closed {
            return Appended::Closed;
        }
        let before = state.events.len();
        state.events.extend(events);
        if state.events.len() > before && !state.scheduled {
            state.scheduled = true;
            Appended::Scheduled
        } else {
            Appended::Queued
        }
    }

    /// Refuse every later append. Events already queued stay until taken.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Take every queued event, leaving the queue empty and idle.
    pub fn take(&self) -> Vec<AggregationEvent> {
        let mut state = self.lock();
        state.scheduled = false;
        std::mem::take(&mut state.events)
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Is a drain currently scheduled?
    pub fn is_scheduled(&self) -> bool {
        self.lock().scheduled
    }
}

#[cfg(test)]
pub(crate) fn event(
    session_id: Id,
    question: &str,
    option: &str,
    participant: &str,
    first: bool,
) -> AggregationEvent {
    AggregationEvent {
        session_id,
        question_id: question.to_string(),
        option_id: option.to_string(),
        participant_id: ParticipantId::from(participant),
        first_vote_for_session: first,
        created_at: Utc::now(),
    }
}
