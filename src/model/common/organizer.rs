use rocket::{
    http::Status,
    request::{FromRequest, Outcome},
    Request,
};

use crate::model::mongodb::Id;

/// Header identifying the organizer making a request.
///
/// Authentication happens in front of this service; by the time a request
/// gets here the header is trusted.
pub const ORGANIZER_HEADER: &str = "x-organizer-id";

/// Request guard for the organizer making a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Organizer(pub Id);

#[derive(Debug)]
pub enum OrganizerError {
    Missing,
    Malformed(String),
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Organizer {
    type Error = OrganizerError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match req.headers().get_one(ORGANIZER_HEADER) {
            Some(value) => match value.parse::<Id>() {
                Ok(id) => Outcome::Success(Organizer(id)),
                Err(_) => Outcome::Failure((
                    Status::BadRequest,
                    OrganizerError::Malformed(value.to_string()),
                )),
            },
            None => Outcome::Failure((Status::Unauthorized, OrganizerError::Missing)),
        }
    }
}
