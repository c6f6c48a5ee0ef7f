use std::ops::Deref;

use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::db::{
    session::{NewSession, Session},
    vote::VoteRecord,
};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Session collections
const SESSIONS: &str = "sessions";
impl MongoCollection for Session {
    const NAME: &'static str = SESSIONS;
}
impl MongoCollection for NewSession {
    const NAME: &'static str = SESSIONS;
}

// Vote ledger collection
const VOTES: &str = "votes";
impl MongoCollection for VoteRecord {
    const NAME: &'static str = VOTES;
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // Session collection: join codes are how participants find a session.
    let join_code_index = IndexModel::builder()
        .keys(doc! {"join_code": 1})
        .options(unique.clone())
        .build();
    let organizer_index = IndexModel::builder().keys(doc! {"organizer": 1}).build();
    let sessions = Coll::<Session>::from_db(db);
    sessions.create_index(join_code_index, None).await?;
    sessions.create_index(organizer_index, None).await?;

    // Vote ledger: one row per participant per question slot.
    let ledger_index = IndexModel::builder()
        .keys(doc! {"session_id": 1, "question_id": 1, "participant_id": 1, "slot": 1})
        .options(unique)
        .build();
    let participant_index = IndexModel::builder()
        .keys(doc! {"session_id": 1, "participant_id": 1})
        .build();
    let votes = Coll::<VoteRecord>::from_db(db);
    votes.create_index(ledger_index, None).await?;
    votes.create_index(participant_index, None).await?;

    Ok(())
}
