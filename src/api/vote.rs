use rocket::{
    http::{CookieJar, Header},
    response::status,
    serde::json::{self, Json},
    Route, State,
};

use crate::error::{Error, Result};
use crate::logging::RequestId;
use crate::model::{
    api::{
        join::{JoinResponse, PublicSession},
        vote::{VoteRequest, VoteResponse},
    },
    common::Participant,
};
use crate::pipeline::{find_open_session, AdmissionGate, Aggregator, Ballot};
use crate::storage::Storage;
use crate::Config;

pub fn routes() -> Vec<Route> {
    routes![join, submit_votes]
}

/// The public session view, echoing the participant identity.
#[derive(Responder)]
struct Joined {
    inner: Json<JoinResponse>,
    participant: Header<'static>,
}

/// Vote acceptance, echoing the participant identity.
#[derive(Responder)]
struct VotesAccepted {
    inner: status::Accepted<Json<VoteResponse>>,
    participant: Header<'static>,
}

#[get("/vote/join/<join_code>")]
async fn join(
    join_code: &str,
    participant: Participant,
    cookies: &CookieJar<'_>,
    storage: &State<Storage>,
    config: &State<Config>,
) -> Result<Joined> {
    let session = find_open_session(storage.sessions.as_ref(), join_code).await?;

    let participant_id = participant.resolve(None);
    participant_id.remember(cookies, config.participant_ttl());

    Ok(Joined {
        participant: participant_id.header(),
        inner: Json(JoinResponse {
            session: PublicSession::from(&session),
            participant_id,
        }),
    })
}

#[post("/vote", data = "<request>")]
#[allow(clippy::too_many_arguments)]
async fn submit_votes(
    request: std::result::Result<Json<VoteRequest>, json::Error<'_>>,
    request_id: RequestId,
    participant: Participant,
    cookies: &CookieJar<'_>,
    storage: &State<Storage>,
    aggregator: &State<Aggregator>,
    config: &State<Config>,
) -> Result<VotesAccepted> {
    let request = request
        .map_err(|e| Error::bad_request(format!("Malformed vote submission: {e}")))?
        .into_inner();
    if request.join_code.is_empty() || request.answers.is_empty() {
        return Err(Error::bad_request("joinCode and answers are required"));
    }

    let participant_id = participant.resolve(request.participant_id.as_deref());
    let ballot = Ballot {
        join_code: request.join_code,
        participant: participant_id.clone(),
        origin: participant.origin(),
        answers: request.answers,
    };
    let admission = AdmissionGate::new(storage, aggregator).admit(ballot).await?;
    debug!(
        "{request_id}: {} votes accepted, {} answers skipped for session {}",
        admission.accepted,
        admission.skipped.len(),
        admission.session_id
    );

    participant_id.remember(cookies, config.participant_ttl());
    Ok(VotesAccepted {
        participant: participant_id.header(),
        inner: status::Accepted(Some(Json(VoteResponse {
            success: true,
            message: "Votes accepted for processing",
            accepted: admission.accepted,
            skipped: admission.skipped,
            participant_id,
        }))),
    })
}
