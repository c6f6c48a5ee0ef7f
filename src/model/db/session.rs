use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::{
    common::{OptionId, QuestionId},
    mongodb::Id,
};

/// A single answer option of a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    /// Unique within its question.
    pub id: OptionId,
    pub text: String,
    /// Aggregated vote counter. Only ever incremented by the aggregator,
    /// or overwritten by reconciliation against the vote ledger.
    #[serde(default)]
    pub votes: u64,
}

/// A single question of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Unique within its session.
    pub id: QuestionId,
    pub text: String,
    /// Whether a participant may select more than one option.
    #[serde(default)]
    pub multiple: bool,
    pub options: Vec<PollOption>,
}

impl Question {
    /// Get the option with the given ID, if it exists.
    pub fn option(&self, option_id: &str) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    pub fn option_mut(&mut self, option_id: &str) -> Option<&mut PollOption> {
        self.options.iter_mut().find(|o| o.id == option_id)
    }
}

/// Session-wide counters maintained by the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analytics {
    /// Number of distinct participants who have voted at least once.
    #[serde(default)]
    pub total_participants: u64,
}

/// Core session data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCore {
    /// Foreign key of the organizer who owns this session.
    pub organizer: Id,
    pub title: String,
    /// Short code participants use to find the session. Unique across sessions.
    pub join_code: String,
    /// Votes are only accepted while this is set.
    pub is_active: bool,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub analytics: Analytics,
}

impl SessionCore {
    /// Get the question with the given ID, if it exists.
    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == question_id)
    }

    pub fn question_mut(&mut self, question_id: &str) -> Option<&mut Question> {
        self.questions.iter_mut().find(|q| q.id == question_id)
    }
}

/// A session without an ID.
pub type NewSession = SessionCore;

/// A session from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub session: SessionCore,
}

impl Deref for Session {
    type Target = SessionCore;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    fn option(id: &str, text: &str) -> PollOption {
        PollOption {
            id: id.to_string(),
            text: text.to_string(),
            votes: 0,
        }
    }

    impl SessionCore {
        /// An active session with a single-select question `q1` (options `a`, `b`)
        /// and a multi-select question `q2` (options `x`, `y`, `z`).
        pub fn example() -> Self {
            Self {
                organizer: Id::new(),
                title: "Team retro".to_string(),
                join_code: "AB12CD".to_string(),
                is_active: true,
                created_at: Utc::now(),
                questions: vec![
                    Question {
                        id: "q1".to_string(),
                        text: "Best sprint so far?".to_string(),
                        multiple: false,
                        options: vec![option("a", "Yes"), option("b", "No")],
                    },
                    Question {
                        id: "q2".to_string(),
                        text: "What went well?".to_string(),
                        multiple: true,
                        options: vec![
                            option("x", "Planning"),
                            option("y", "Reviews"),
                            option("z", "Releases"),
                        ],
                    },
                ],
                analytics: Analytics::default(),
            }
        }

        /// The example session, but closed for voting.
        pub fn inactive_example() -> Self {
            Self {
                join_code: "CLOSED".to_string(),
                is_active: false,
                ..Self::example()
            }
        }
    }
}
