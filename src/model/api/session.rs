use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::{
    common::{codes::generated_id, OptionId, QuestionId},
    db::session::{Analytics, NewSession, PollOption, Question, Session},
    mongodb::Id,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSpec {
    #[serde(default)]
    pub id: Option<OptionId>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSpec {
    #[serde(default)]
    pub id: Option<QuestionId>,
    pub text: String,
    #[serde(default)]
    pub multiple: bool,
    pub options: Vec<OptionSpec>,
}

/// A session as specified by its organizer on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub title: String,
    #[serde(default)]
    pub questions: Vec<QuestionSpec>,
}

impl SessionSpec {
    /// Turn the request into a storable session, filling in missing IDs.
    /// Sessions always start inactive with zeroed counters.
    pub fn into_new_session(
        self,
        organizer: Id,
        join_code: String,
        rng: &mut impl Rng,
    ) -> Result<NewSession, String> {
        if self.title.trim().is_empty() {
            return Err("Session title must not be empty".to_string());
        }

        let mut question_ids = HashSet::new();
        let mut questions = Vec::with_capacity(self.questions.len());
        for question in self.questions {
            if question.options.is_empty() {
                return Err(format!("Question '{}' has no options", question.text));
            }
            let id = question.id.unwrap_or_else(|| generated_id(rng));
            if !question_ids.insert(id.clone()) {
                return Err(format!("Duplicate question ID '{id}'"));
            }

            let mut option_ids = HashSet::new();
            let mut options = Vec::with_capacity(question.options.len());
            for option in question.options {
                let option_id = option.id.unwrap_or_else(|| generated_id(rng));
                if !option_ids.insert(option_id.clone()) {
                    return Err(format!(
                        "Duplicate option ID '{option_id}' in question '{id}'"
                    ));
                }
                options.push(PollOption {
                    id: option_id,
                    text: option.text,
                    votes: 0,
                });
            }

            questions.push(Question {
                id,
                text: question.text,
                multiple: question.multiple,
                options,
            });
        }

        Ok(NewSession {
            organizer,
            title: self.title,
            join_code,
            is_active: false,
            created_at: Utc::now(),
            questions,
            analytics: Analytics::default(),
        })
    }
}

/// Fields an organizer may change after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.is_active.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionTally {
    pub id: OptionId,
    pub text: String,
    pub votes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionTally {
    pub id: QuestionId,
    pub text: String,
    pub multiple: bool,
    pub options: Vec<OptionTally>,
}

/// The organizer-facing view of a session, including tallies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub id: String,
    pub organizer: String,
    pub title: String,
    pub join_code: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub questions: Vec<QuestionTally>,
    pub total_participants: u64,
}

impl From<Session> for SessionDescription {
    fn from(session: Session) -> Self {
        let id = session.id.to_string();
        let core = session.session;
        Self {
            id,
            organizer: core.organizer.to_string(),
            title: core.title,
            join_code: core.join_code,
            is_active: core.is_active,
            created_at: core.created_at,
            questions: core
                .questions
                .into_iter()
                .map(|q| QuestionTally {
                    id: q.id,
                    text: q.text,
                    multiple: q.multiple,
                    options: q
                        .options
                        .into_iter()
                        .map(|o| OptionTally {
                            id: o.id,
                            text: o.text,
                            votes: o.votes,
                        })
                        .collect(),
                })
                .collect(),
            total_participants: core.analytics.total_participants,
        }
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl SessionSpec {
        pub fn example() -> Self {
            Self {
                title: "Friday quiz".to_string(),
                questions: vec![
                    QuestionSpec {
                        id: Some("q1".to_string()),
                        text: "Tabs or spaces?".to_string(),
                        multiple: false,
                        options: vec![
                            OptionSpec {
                                id: Some("a".to_string()),
                                text: "Tabs".to_string(),
                            },
                            OptionSpec {
                                id: Some("b".to_string()),
                                text: "Spaces".to_string(),
                            },
                        ],
                    },
                    QuestionSpec {
                        id: None,
                        text: "Favourite editors?".to_string(),
                        multiple: true,
                        options: vec![
                            OptionSpec {
                                id: None,
                                text: "vim".to_string(),
                            },
                            OptionSpec {
                                id: None,
                                text: "emacs".to_string(),
                            },
                        ],
                    },
                ],
            }
        }
    }
}
