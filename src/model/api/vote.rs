use serde::{Deserialize, Serialize};

use crate::model::common::{OptionId, ParticipantId, QuestionId};
use crate::pipeline::SkipReason;

/// One answer of a vote submission.
///
/// Either `optionIds` or the single-option shorthand `optionId` may be given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSpec {
    #[serde(default)]
    pub question_id: Option<QuestionId>,
    #[serde(default)]
    pub option_ids: Option<Vec<OptionId>>,
    #[serde(default)]
    pub option_id: Option<OptionId>,
}

impl AnswerSpec {
    /// The selected option IDs, whichever way they were supplied.
    pub fn selected(&self) -> Vec<OptionId> {
        match (&self.option_ids, &self.option_id) {
            (Some(ids), _) => ids.clone(),
            (None, Some(id)) if !id.is_empty() => vec![id.clone()],
            _ => Vec::new(),
        }
    }
}

/// A vote submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    #[serde(default)]
    pub join_code: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub answers: Vec<AnswerSpec>,
}

/// An answer that was not counted, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Skipped {
    pub question_id: QuestionId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub success: bool,
    pub message: &'static str,
    pub accepted: usize,
    pub skipped: Vec<Skipped>,
    pub participant_id: ParticipantId,
}
