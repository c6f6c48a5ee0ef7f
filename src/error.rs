use mongodb::error::Error as DbError;
use rocket::{
    http::Status,
    response::{self, Responder},
    serde::json::{json, Json},
    Request,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Inactive: {0}")]
    Inactive(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn bad_request(why: impl Into<String>) -> Self {
        Self::BadRequest(why.into())
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Db(_) | Self::Unavailable(_) => Status::InternalServerError,
            Self::BadRequest(_) => Status::BadRequest,
            Self::NotFound(_) => Status::NotFound,
            Self::Inactive(_) | Self::Forbidden(_) => Status::Forbidden,
            Self::Unauthorized(_) => Status::Unauthorized,
        }
    }

    /// Is this a failure of the backing infrastructure rather than of the request?
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Db(_) | Self::Unavailable(_))
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let status = self.status();
        // Never leak storage details to the client.
        let message = if self.is_infrastructure() {
            error!("{self}");
            "Internal server error".to_string()
        } else {
            debug!("{self}");
            self.to_string()
        };
        let body = Json(json!({ "success": false, "message": message }));
        response::Response::build_from(body.respond_to(req)?)
            .status(status)
            .ok()
    }
}
