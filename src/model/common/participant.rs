use std::{
    fmt::{Display, Formatter},
    net::IpAddr,
    ops::Deref,
};

use rocket::{
    http::{Cookie, CookieJar, Header, SameSite},
    request::{FromRequest, Outcome},
    Request,
};
use serde::{Deserialize, Serialize};

use super::codes::random_hex;

/// Name of the long-lived cookie carrying the participant identity.
pub const PARTICIPANT_COOKIE: &str = "participantId";

/// Header carrying the participant identity, in both directions.
pub const PARTICIPANT_HEADER: &str = "x-participant-id";

/// Length of freshly generated participant IDs.
const PARTICIPANT_ID_LEN: usize = 32;

/// Opaque, unauthenticated participant identity.
/// Only used for deduplicating votes and counting participation.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Issue a brand new participant identity.
    pub fn generate() -> Self {
        Self(random_hex(&mut rand::thread_rng(), PARTICIPANT_ID_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store the identity client-side for `ttl`.
    pub fn remember(&self, cookies: &CookieJar<'_>, ttl: time::Duration) {
        let cookie = Cookie::build(PARTICIPANT_COOKIE, self.0.clone())
            .path("/")
            .http_only(false)
            .same_site(SameSite::Lax)
            .max_age(ttl)
            .finish();
        cookies.add(cookie);
    }

    /// The response header echoing this identity.
    pub fn header(&self) -> Header<'static> {
        Header::new(PARTICIPANT_HEADER, self.0.clone())
    }
}

impl Deref for ParticipantId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Request guard for the participant identity the client carries (if any),
/// together with the address the request came from. Never fails.
#[derive(Debug, Clone)]
pub struct Participant {
    carried: Option<ParticipantId>,
    pub origin: Option<IpAddr>,
}

impl Participant {
    /// Pick the identity for this request: an explicitly supplied one first,
    /// then whatever the client carried, else a fresh one.
    pub fn resolve(&self, explicit: Option<&str>) -> ParticipantId {
        explicit
            .filter(|id| !id.is_empty())
            .map(ParticipantId::from)
            .or_else(|| self.carried.clone())
            .unwrap_or_else(ParticipantId::generate)
    }

    /// The origin address as stored on ledger rows.
    pub fn origin(&self) -> Option<String> {
        self.origin.map(|ip| ip.to_string())
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Participant {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let from_header = req
            .headers()
            .get_one(PARTICIPANT_HEADER)
            .filter(|id| !id.is_empty())
            .map(ParticipantId::from);
        let carried = from_header.or_else(|| {
            req.cookies()
                .get(PARTICIPANT_COOKIE)
                .map(|cookie| cookie.value())
                .filter(|id| !id.is_empty())
                .map(ParticipantId::from)
        });
        Outcome::Success(Participant {
            carried,
            origin: req.client_ip(),
        })
    }
}
