use rocket::{
    response::status,
    serde::json::{self, Json},
    Route, State,
};

use crate::{
    error::{Error, Result},
    model::{
        api::session::{SessionDescription, SessionSpec, SessionUpdate},
        common::{codes::join_code, Organizer},
        db::session::Session,
        mongodb::Id,
    },
    pipeline::{reconcile, Aggregator},
    storage::Storage,
};

/// How many join codes to try before giving up on creating a session.
const JOIN_CODE_ATTEMPTS: usize = 5;

pub fn routes() -> Vec<Route> {
    routes![
        create_session,
        get_sessions,
        get_session,
        modify_session,
        reconcile_session,
    ]
}

#[post("/session", data = "<spec>", format = "json")]
async fn create_session(
    organizer: Organizer,
    spec: std::result::Result<Json<SessionSpec>, json::Error<'_>>,
    storage: &State<Storage>,
) -> Result<status::Created<Json<SessionDescription>>> {
    let spec = spec
        .map_err(|e| Error::bad_request(format!("Malformed session: {e}")))?
        .into_inner();

    let mut new_session = {
        let mut rng = rand::thread_rng();
        let code = join_code(&mut rng);
        spec.into_new_session(organizer.0, code, &mut rng)
            .map_err(Error::BadRequest)?
    };

    for _ in 0..JOIN_CODE_ATTEMPTS {
        if let Some(session) = storage.sessions.insert_session(&new_session).await? {
            info!(
                "Organizer {} created session {} with join code {}",
                organizer.0, session.id, session.join_code
            );
            let location = format!("/api/session/{}", session.id);
            return Ok(status::Created::new(location).body(Json(session.into())));
        }
        debug!("Join code {} already taken, retrying", new_session.join_code);
        new_session.join_code = join_code(&mut rand::thread_rng());
    }

    Err(Error::Unavailable(format!(
        "no free join code after {JOIN_CODE_ATTEMPTS} attempts"
    )))
}

#[get("/session")]
async fn get_sessions(
    _organizer: Organizer,
    storage: &State<Storage>,
) -> Result<Json<Vec<SessionDescription>>> {
    let sessions = storage.sessions.list_active().await?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

#[get("/session/<session_id>")]
async fn get_session(
    _organizer: Organizer,
    session_id: Id,
    storage: &State<Storage>,
) -> Result<Json<SessionDescription>> {
    let session = storage
        .sessions
        .find_by_id(session_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Session {session_id}")))?;
    Ok(Json(session.into()))
}

/// Fetch a session, checking the organizer owns it.
async fn owned_session(storage: &Storage, organizer: Organizer, session_id: Id) -> Result<Session> {
    let session = storage
        .sessions
        .find_by_id(session_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Session {session_id}")))?;
    if session.organizer != organizer.0 {
        return Err(Error::Forbidden(format!(
            "Session {session_id} belongs to another organizer"
        )));
    }
    Ok(session)
}

#[patch("/session/<session_id>", data = "<update>", format = "json")]
async fn modify_session(
    organizer: Organizer,
    session_id: Id,
    update: std::result::Result<Json<SessionUpdate>, json::Error<'_>>,
    storage: &State<Storage>,
) -> Result<Json<SessionDescription>> {
    let update = update
        .map_err(|e| Error::bad_request(format!("Malformed update: {e}")))?
        .into_inner();
    if update.title.as_deref().map_or(false, |t| t.trim().is_empty()) {
        return Err(Error::bad_request("Session title must not be empty"));
    }

    let session = owned_session(storage, organizer, session_id).await?;
    if update.is_empty() {
        return Ok(Json(session.into()));
    }

    let session = storage
        .sessions
        .update_session(session_id, &update)
        .await?
        .ok_or_else(|| Error::not_found(format!("Session {session_id}")))?;
    if let Some(active) = update.is_active {
        info!(
            "Session {session_id} {}",
            if active { "opened" } else { "closed" }
        );
    }
    Ok(Json(session.into()))
}

#[post("/session/<session_id>/reconcile")]
async fn reconcile_session(
    organizer: Organizer,
    session_id: Id,
    storage: &State<Storage>,
    aggregator: &State<Aggregator>,
) -> Result<Json<SessionDescription>> {
    owned_session(storage, organizer, session_id).await?;
    let session = reconcile(storage, aggregator, session_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Session {session_id}")))?;
    Ok(Json(session.into()))
}
