//! Types shared between the API and database representations.

pub mod codes;
pub mod organizer;
pub mod participant;

pub use organizer::Organizer;
pub use participant::{Participant, ParticipantId};

/// Question IDs are short strings, unique within their session.
pub type QuestionId = String;

/// Option IDs are short strings, unique within their question.
pub type OptionId = String;
