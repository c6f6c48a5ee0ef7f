use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::{
    common::{OptionId, ParticipantId, QuestionId},
    db::session::Question,
    mongodb::Id,
};

/// A single vote, as stored in the ledger.
///
/// The ledger is the source of truth for all tallies; the counters on the
/// session are an eventually consistent aggregate of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    /// Foreign key session ID.
    pub session_id: Id,
    pub question_id: QuestionId,
    pub option_id: OptionId,
    pub participant_id: ParticipantId,
    /// Uniqueness slot within the question: the option ID for multi-select
    /// questions, empty for single-select ones. The ledger allows at most one
    /// record per (session, question, participant, slot).
    pub slot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl VoteRecord {
    pub fn new(
        session_id: Id,
        question: &Question,
        option_id: &str,
        participant_id: &ParticipantId,
        origin: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let slot = if question.multiple {
            option_id.to_string()
        } else {
            String::new()
        };
        Self {
            session_id,
            question_id: question.id.clone(),
            option_id: option_id.to_string(),
            participant_id: participant_id.clone(),
            slot,
            origin,
            created_at,
        }
    }

    /// The key the ledger enforces uniqueness on.
    pub fn unique_key(&self) -> (Id, &str, &str, &str) {
        (
            self.session_id,
            self.question_id.as_str(),
            self.participant_id.as_str(),
            self.slot.as_str(),
        )
    }
}

/// Outcome of writing a single record as part of a batch insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another record already occupies the same uniqueness slot.
    Duplicate,
    /// The record could not be written for some other reason.
    Failed(String),
}
