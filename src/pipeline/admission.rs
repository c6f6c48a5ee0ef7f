use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use chrono::Utc;
use serde::{Serialize, Serializer};

use crate::error::{Error, Result};
use crate::model::{
    api::vote::{AnswerSpec, Skipped},
    common::{OptionId, ParticipantId, QuestionId},
    db::{
        session::{Question, Session},
        vote::{InsertOutcome, VoteRecord},
    },
    mongodb::Id,
};
use crate::storage::{SessionStore, Storage};

use super::{aggregator::Aggregator, queue::AggregationEvent};

/// Why an answer was not counted. These never fail the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingFields,
    QuestionNotFound,
    MultipleNotAllowed,
    InvalidOptions(Vec<OptionId>),
    AlreadyVoted,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFields => f.write_str("Missing questionId or optionIds"),
            Self::QuestionNotFound => f.write_str("Question not found in session"),
            Self::MultipleNotAllowed => {
                f.write_str("Multiple choices not allowed for this question")
            }
            Self::InvalidOptions(ids) => write!(f, "Invalid option id(s): {}", ids.join(",")),
            Self::AlreadyVoted => f.write_str("Participant already voted this question"),
        }
    }
}

impl Serialize for SkipReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A vote submission, with the participant already resolved.
#[derive(Debug, Clone)]
pub struct Ballot {
    pub join_code: String,
    pub participant: ParticipantId,
    pub origin: Option<String>,
    pub answers: Vec<AnswerSpec>,
}

/// The result of admitting a ballot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub session_id: Id,
    /// Votes handed to the aggregator.
    pub accepted: usize,
    pub skipped: Vec<Skipped>,
}

impl Admission {
    fn skip(&mut self, question_id: impl Into<QuestionId>, reason: SkipReason) {
        self.skipped.push(Skipped {
            question_id: question_id.into(),
            reason,
        });
    }
}

/// Find a session by join code, failing unless it is open for voting.
pub async fn find_open_session(sessions: &dyn SessionStore, join_code: &str) -> Result<Session> {
    let session = sessions
        .find_by_join_code(join_code)
        .await?
        .ok_or_else(|| Error::not_found(format!("Session with join code '{join_code}'")))?;
    if !session.is_active {
        return Err(Error::Inactive(format!(
            "Session with join code '{join_code}' is not active"
        )));
    }
    Ok(session)
}

/// Validates and deduplicates vote submissions, records them in the ledger,
/// and hands them to the aggregator.
///
/// Runs independently per request; concurrent requests from one participant
/// are only serialised by the ledger's uniqueness constraint.
pub struct AdmissionGate<'a> {
    storage: &'a Storage,
    aggregator: &'a Aggregator,
}

impl<'a> AdmissionGate<'a> {
    pub fn new(storage: &'a Storage, aggregator: &'a Aggregator) -> Self {
        Self {
            storage,
            aggregator,
        }
    }

    pub async fn admit(&self, ballot: Ballot) -> Result<Admission> {
        let session = find_open_session(self.storage.sessions.as_ref(), &ballot.join_code).await?;
        let participant = &ballot.participant;

        // Checked once, up front. Concurrent first votes may both see `true`.
        let first_vote = !self
            .storage
            .ledger
            .has_any_vote(session.id, participant)
            .await?;

        let mut admission = Admission {
            session_id: session.id,
            accepted: 0,
            skipped: Vec::new(),
        };
        let mut answered: HashSet<QuestionId> = HashSet::new();
        let mut records = Vec::new();
        let now = Utc::now();

        for answer in &ballot.answers {
            let question_id = match answer.question_id.as_deref() {
                Some(id) if !id.is_empty() => id,
                _ => {
                    admission.skip("unknown", SkipReason::MissingFields);
                    continue;
                }
            };
            let selected = answer.selected();
            if selected.is_empty() {
                admission.skip(question_id, SkipReason::MissingFields);
                continue;
            }
            let question = match session.question(question_id) {
                Some(question) => question,
                None => {
                    admission.skip(question_id, SkipReason::QuestionNotFound);
                    continue;
                }
            };
            // Validated as submitted: a single-select answer naming the same
            // option twice still names more than one.
            if let Err(reason) = validate_selection(question, &selected) {
                admission.skip(question_id, reason);
                continue;
            }
            let selected = dedup(selected);
            if answered.contains(question_id)
                || self.already_voted(&session, question, &selected, participant).await?
            {
                admission.skip(question_id, SkipReason::AlreadyVoted);
                continue;
            }
            answered.insert(question_id.to_string());

            records.extend(selected.iter().map(|option_id| {
                VoteRecord::new(
                    session.id,
                    question,
                    option_id,
                    participant,
                    ballot.origin.clone(),
                    now,
                )
            }));
        }

        let outcomes = self.storage.ledger.insert_votes(&records).await?;
        if outcomes.len() != records.len() {
            warn!(
                "Ledger returned {} outcomes for {} votes",
                outcomes.len(),
                records.len()
            );
        }

        let mut events = Vec::with_capacity(records.len());
        let mut lost_races: HashSet<QuestionId> = HashSet::new();
        for (record, outcome) in records.into_iter().zip(outcomes) {
            match outcome {
                InsertOutcome::Inserted => {}
                // Another request from this participant got there first and
                // already queued this vote.
                InsertOutcome::Duplicate => {
                    if lost_races.insert(record.question_id.clone()) {
                        admission.skip(record.question_id, SkipReason::AlreadyVoted);
                    }
                    continue;
                }
                InsertOutcome::Failed(message) => {
                    warn!(
                        "Ledger write failed for session {} question {}: {message}",
                        record.session_id, record.question_id
                    );
                }
            }
            events.push(AggregationEvent {
                session_id: record.session_id,
                question_id: record.question_id,
                option_id: record.option_id,
                participant_id: record.participant_id,
                first_vote_for_session: first_vote,
                created_at: record.created_at,
            });
        }

        admission.accepted = events.len();
        if !events.is_empty() {
            self.aggregator.submit(events);
        }
        Ok(admission)
    }

    /// For single-select questions any prior vote counts; for multi-select
    /// ones only a prior vote for one of the same options does.
    async fn already_voted(
        &self,
        session: &Session,
        question: &Question,
        selected: &[OptionId],
        participant: &ParticipantId,
    ) -> Result<bool> {
        let ledger = &self.storage.ledger;
        if !question.multiple {
            return ledger.has_voted(session.id, &question.id, participant).await;
        }
        for option_id in selected {
            if ledger
                .has_voted_option(session.id, &question.id, option_id, participant)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Collapse repeated option IDs, keeping the first occurrence.
fn dedup(options: Vec<OptionId>) -> Vec<OptionId> {
    let mut seen = HashSet::new();
    options
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

fn validate_selection(
    question: &Question,
    selected: &[OptionId],
) -> std::result::Result<(), SkipReason> {
    if !question.multiple && selected.len() > 1 {
        return Err(SkipReason::MultipleNotAllowed);
    }
    let invalid: Vec<OptionId> = dedup(
        selected
            .iter()
            .filter(|id| question.option(id).is_none())
            .cloned()
            .collect(),
    );
    if !invalid.is_empty() {
        return Err(SkipReason::InvalidOptions(invalid));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use rocket::tokio::time::Duration;

    use crate::model::db::session::SessionCore;
    use crate::storage::MemoryStore;

    struct Fixture {
        store: MemoryStore,
        storage: Storage,
        aggregator: Aggregator,
        session: Session,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = MemoryStore::new();
            let storage = Storage::memory(store.clone());
            let session = storage
                .sessions
                .insert_session(&SessionCore::example())
                .await
                .unwrap()
                .unwrap();
            storage
                .sessions
                .insert_session(&SessionCore::inactive_example())
                .await
                .unwrap()
                .unwrap();
            // Long delay: tests flush explicitly.
            let aggregator = Aggregator::new(storage.sessions.clone(), Duration::from_secs(3600));
            Self {
                store,
                storage,
                aggregator,
                session,
            }
        }

        async fn vote(&self, participant: &str, answers: Vec<AnswerSpec>) -> Result<Admission> {
            self.vote_in("AB12CD", participant, answers).await
        }

        async fn vote_in(
            &self,
            join_code: &str,
            participant: &str,
            answers: Vec<AnswerSpec>,
        ) -> Result<Admission> {
            let ballot = Ballot {
                join_code: join_code.to_string(),
                participant: ParticipantId::from(participant),
                origin: Some("10.0.0.1".to_string()),
                answers,
            };
            AdmissionGate::new(&self.storage, &self.aggregator)
                .admit(ballot)
                .await
        }

        async fn votes(&self, question: &str, option: &str) -> u64 {
            let session = self
                .storage
                .sessions
                .find_by_id(self.session.id)
                .await
                .unwrap()
                .unwrap();
            session.question(question).unwrap().option(option).unwrap().votes
        }

        async fn participants(&self) -> u64 {
            let session = self
                .storage
                .sessions
                .find_by_id(self.session.id)
                .await
                .unwrap()
                .unwrap();
            session.analytics.total_participants
        }
    }

    fn answer(question: &str, options: &[&str]) -> AnswerSpec {
        AnswerSpec {
            question_id: Some(question.to_string()),
            option_ids: Some(options.iter().map(|o| o.to_string()).collect()),
            option_id: None,
        }
    }

    fn reasons(admission: &Admission) -> Vec<(String, String)> {
        admission
            .skipped
            .iter()
            .map(|s| (s.question_id.clone(), s.reason.to_string()))
            .collect()
    }

    #[rocket::async_test]
    async fn unknown_join_code_is_not_found() {
        let fixture = Fixture::new().await;
        let err = fixture
            .vote_in("NOPE00", "p", vec![answer("q1", &["a"])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[rocket::async_test]
    async fn inactive_session_accepts_nothing() {
        let fixture = Fixture::new().await;
        let err = fixture
            .vote_in("CLOSED", "p", vec![answer("q1", &["a"])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inactive(_)));
        assert!(fixture.store.votes().unwrap().is_empty());
        assert_eq!(fixture.aggregator.queued(), 0);
    }

    #[rocket::async_test]
    async fn second_single_select_vote_is_skipped() {
        let fixture = Fixture::new().await;

        let first = fixture.vote("p", vec![answer("q1", &["a"])]).await.unwrap();
        assert_eq!(first.accepted, 1);
        assert!(first.skipped.is_empty());

        let second = fixture.vote("p", vec![answer("q1", &["b"])]).await.unwrap();
        assert_eq!(second.accepted, 0);
        assert_eq!(
            reasons(&second),
            vec![(
                "q1".to_string(),
                "Participant already voted this question".to_string()
            )]
        );

        fixture.aggregator.flush().await;
        assert_eq!(fixture.votes("q1", "a").await, 1);
        assert_eq!(fixture.votes("q1", "b").await, 0);
        assert_eq!(fixture.store.votes().unwrap().len(), 1);
        assert_eq!(fixture.participants().await, 1);
    }

    #[rocket::async_test]
    async fn multi_select_records_every_option() {
        let fixture = Fixture::new().await;
        let admission = fixture
            .vote("p2", vec![answer("q2", &["x", "y"])])
            .await
            .unwrap();
        assert_eq!(admission.accepted, 2);
        assert_eq!(fixture.aggregator.queued(), 2);

        fixture.aggregator.flush().await;
        assert_eq!(fixture.votes("q2", "x").await, 1);
        assert_eq!(fixture.votes("q2", "y").await, 1);
        assert_eq!(fixture.votes("q2", "z").await, 0);
        assert_eq!(fixture.participants().await, 1);
        assert_eq!(fixture.store.votes().unwrap().len(), 2);
    }

    #[rocket::async_test]
    async fn multi_select_repeat_click_is_skipped() {
        let fixture = Fixture::new().await;
        fixture.vote("p", vec![answer("q2", &["x"])]).await.unwrap();

        let repeat = fixture
            .vote("p", vec![answer("q2", &["x", "z"])])
            .await
            .unwrap();
        assert_eq!(repeat.accepted, 0);
        assert_eq!(repeat.skipped[0].reason, SkipReason::AlreadyVoted);

        // A different option of the same question is still allowed.
        let more = fixture.vote("p", vec![answer("q2", &["z"])]).await.unwrap();
        assert_eq!(more.accepted, 1);

        fixture.aggregator.flush().await;
        assert_eq!(fixture.votes("q2", "x").await, 1);
        assert_eq!(fixture.votes("q2", "z").await, 1);
        // Only the very first request counted as a first vote.
        assert_eq!(fixture.participants().await, 1);
    }

    #[rocket::async_test]
    async fn invalid_answers_are_skipped_individually() {
        let fixture = Fixture::new().await;
        let admission = fixture
            .vote(
                "p",
                vec![
                    AnswerSpec::default(),
                    answer("q9", &["a"]),
                    answer("q1", &["a", "b"]),
                    answer("q2", &["x", "nope", "gone"]),
                    answer("q1", &[]),
                    answer("q2", &["y", "y"]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(admission.accepted, 1);
        assert_eq!(
            reasons(&admission),
            vec![
                ("unknown".to_string(), "Missing questionId or optionIds".to_string()),
                ("q9".to_string(), "Question not found in session".to_string()),
                (
                    "q1".to_string(),
                    "Multiple choices not allowed for this question".to_string()
                ),
                ("q2".to_string(), "Invalid option id(s): nope,gone".to_string()),
                ("q1".to_string(), "Missing questionId or optionIds".to_string()),
            ]
        );
        let votes = fixture.store.votes().unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].option_id, "y");
        assert_eq!(votes[0].origin.as_deref(), Some("10.0.0.1"));
    }

    #[rocket::async_test]
    async fn single_select_rejects_repeated_option() {
        let fixture = Fixture::new().await;
        let admission = fixture
            .vote("p", vec![answer("q1", &["a", "a"])])
            .await
            .unwrap();
        assert_eq!(admission.accepted, 0);
        assert_eq!(
            reasons(&admission),
            vec![(
                "q1".to_string(),
                "Multiple choices not allowed for this question".to_string()
            )]
        );
        assert!(fixture.store.votes().unwrap().is_empty());
        assert_eq!(fixture.aggregator.queued(), 0);
    }

    #[rocket::async_test]
    async fn question_repeated_within_a_request_counts_once() {
        let fixture = Fixture::new().await;
        let admission = fixture
            .vote("p", vec![answer("q1", &["a"]), answer("q1", &["b"])])
            .await
            .unwrap();
        assert_eq!(admission.accepted, 1);
        assert_eq!(admission.skipped[0].reason, SkipReason::AlreadyVoted);
    }

    #[rocket::async_test]
    async fn concurrent_duplicates_are_counted_once() {
        let fixture = Fixture::new().await;
        let (first, second) = rocket::tokio::join!(
            fixture.vote("racer", vec![answer("q1", &["a"])]),
            fixture.vote("racer", vec![answer("q1", &["b"])]),
        );
        let accepted = first.unwrap().accepted + second.unwrap().accepted;
        assert_eq!(accepted, 1);

        fixture.aggregator.flush().await;
        let total = fixture.votes("q1", "a").await + fixture.votes("q1", "b").await;
        assert_eq!(total, 1);
        assert_eq!(fixture.store.votes().unwrap().len(), 1);
    }

    #[rocket::async_test]
    async fn storage_failure_aborts_the_request() {
        let fixture = Fixture::new().await;
        fixture.store.set_offline(true);
        let err = fixture
            .vote("p", vec![answer("q1", &["a"])])
            .await
            .unwrap_err();
        assert!(err.is_infrastructure());
    }

    #[rocket::async_test]
    async fn counters_reconcile_with_the_ledger_once_drained() {
        let fixture = Fixture::new().await;
        for (i, option) in ["a", "b", "a", "a"].into_iter().enumerate() {
            let participant = format!("p{i}");
            fixture
                .vote(
                    &participant,
                    vec![answer("q1", &[option]), answer("q2", &["x", "z"])],
                )
                .await
                .unwrap();
        }
        fixture.aggregator.flush().await;

        let ledger = fixture.storage.ledger.tally(fixture.session.id).await.unwrap();
        for (question, option) in [("q1", "a"), ("q1", "b"), ("q2", "x"), ("q2", "y"), ("q2", "z")] {
            assert_eq!(
                fixture.votes(question, option).await,
                ledger.votes_for(question, option)
            );
        }
        assert_eq!(fixture.participants().await, 4);
        assert_eq!(ledger.participants, 4);
    }
}
