use serde::{Deserialize, Serialize};

use crate::model::{
    common::{OptionId, ParticipantId, QuestionId},
    db::session::{PollOption, Question, Session},
};

/// An option as shown to participants: no vote counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicOption {
    pub id: OptionId,
    pub text: String,
}

impl From<&PollOption> for PublicOption {
    fn from(option: &PollOption) -> Self {
        Self {
            id: option.id.clone(),
            text: option.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicQuestion {
    pub id: QuestionId,
    pub text: String,
    pub multiple: bool,
    pub options: Vec<PublicOption>,
}

impl From<&Question> for PublicQuestion {
    fn from(question: &Question) -> Self {
        Self {
            id: question.id.clone(),
            text: question.text.clone(),
            multiple: question.multiple,
            options: question.options.iter().map(Into::into).collect(),
        }
    }
}

/// The participant-facing view of a session. Tallies are withheld.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSession {
    pub id: String,
    pub title: String,
    pub join_code: String,
    pub questions: Vec<PublicQuestion>,
}

impl From<&Session> for PublicSession {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.to_string(),
            title: session.title.clone(),
            join_code: session.join_code.clone(),
            questions: session.questions.iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub session: PublicSession,
    pub participant_id: ParticipantId,
}
