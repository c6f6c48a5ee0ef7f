use mongodb::{
    bson::{self, doc, Document},
    options::{FindOneAndUpdateOptions, InsertManyOptions, ReturnDocument, UpdateOptions},
    Database,
};
use rocket::futures::TryStreamExt;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{
    api::session::SessionUpdate,
    common::ParticipantId,
    db::{
        session::{NewSession, Session},
        vote::{InsertOutcome, VoteRecord},
    },
    mongodb::{bulk_write_failures, is_duplicate_key_error, Coll, Id, DUPLICATE_KEY},
};

use super::{LedgerTally, SessionStore, VoteLedger};

/// MongoDB-backed sessions and vote ledger.
#[derive(Clone)]
pub struct MongoStore {
    sessions: Coll<Session>,
    new_sessions: Coll<NewSession>,
    votes: Coll<VoteRecord>,
}

impl MongoStore {
    pub fn new(db: &Database) -> Self {
        Self {
            sessions: Coll::from_db(db),
            new_sessions: Coll::from_db(db),
            votes: Coll::from_db(db),
        }
    }
}

/// Counters are stored as signed 64-bit integers.
fn as_bson_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[rocket::async_trait]
impl SessionStore for MongoStore {
    async fn find_by_join_code(&self, join_code: &str) -> Result<Option<Session>> {
        let filter = doc! { "join_code": join_code };
        Ok(self.sessions.find_one(filter, None).await?)
    }

    async fn find_by_id(&self, id: Id) -> Result<Option<Session>> {
        Ok(self.sessions.find_one(id.as_doc(), None).await?)
    }

    async fn increment_option_votes(
        &self,
        session_id: Id,
        question_id: &str,
        option_id: &str,
        delta: u64,
    ) -> Result<()> {
        let filter = doc! {
            "_id": session_id,
            "questions.id": question_id,
        };
        let update = doc! {
            "$inc": { "questions.$[q].options.$[o].votes": as_bson_count(delta) }
        };
        let options = UpdateOptions::builder()
            .array_filters(vec![doc! { "q.id": question_id }, doc! { "o.id": option_id }])
            .build();
        self.sessions.update_one(filter, update, options).await?;
        Ok(())
    }

    async fn increment_participant_count(&self, session_id: Id, delta: u64) -> Result<()> {
        let update = doc! {
            "$inc": { "analytics.total_participants": as_bson_count(delta) }
        };
        self.sessions
            .update_one(session_id.as_doc(), update, None)
            .await?;
        Ok(())
    }

    async fn insert_session(&self, session: &NewSession) -> Result<Option<Session>> {
        match self.new_sessions.insert_one(session, None).await {
            Ok(result) => {
                let id: Id = result
                    .inserted_id
                    .as_object_id()
                    .ok_or_else(|| Error::Unavailable("Inserted session has no ID".to_string()))?
                    .into();
                Ok(Some(Session {
                    id,
                    session: session.clone(),
                }))
            }
            Err(err) if is_duplicate_key_error(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_active(&self) -> Result<Vec<Session>> {
        let filter = doc! { "is_active": true };
        let sessions = self
            .sessions
            .find(filter, None)
            .await?
            .try_collect()
            .await?;
        Ok(sessions)
    }

    async fn update_session(&self, id: Id, update: &SessionUpdate) -> Result<Option<Session>> {
        let mut set = Document::new();
        if let Some(ref title) = update.title {
            set.insert("title", title);
        }
        if let Some(is_active) = update.is_active {
            set.insert("is_active", is_active);
        }
        if set.is_empty() {
            return self.find_by_id(id).await;
        }

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let session = self
            .sessions
            .find_one_and_update(id.as_doc(), doc! { "$set": set }, options)
            .await?;
        Ok(session)
    }

    async fn overwrite_counters(&self, id: Id, tally: &LedgerTally) -> Result<Option<Session>> {
        let session = match self.find_by_id(id).await? {
            Some(session) => session,
            None => return Ok(None),
        };

        // Every counter is set in place through array filters, leaving the
        // rest of the question documents alone.
        let mut set = Document::new();
        set.insert(
            "analytics.total_participants",
            as_bson_count(tally.participants),
        );
        let mut array_filters = Vec::new();
        for (qi, question) in session.questions.iter().enumerate() {
            if question.options.is_empty() {
                continue;
            }
            let q = format!("q{qi}");
            let mut filter = Document::new();
            filter.insert(format!("{q}.id"), question.id.as_str());
            array_filters.push(filter);
            for (oi, option) in question.options.iter().enumerate() {
                let o = format!("q{qi}o{oi}");
                let mut filter = Document::new();
                filter.insert(format!("{o}.id"), option.id.as_str());
                array_filters.push(filter);
                set.insert(
                    format!("questions.$[{q}].options.$[{o}].votes"),
                    as_bson_count(tally.votes_for(&question.id, &option.id)),
                );
            }
        }

        let options = FindOneAndUpdateOptions::builder()
            .array_filters(array_filters)
            .return_document(ReturnDocument::After)
            .build();
        let session = self
            .sessions
            .find_one_and_update(id.as_doc(), doc! { "$set": set }, options)
            .await?;
        Ok(session)
    }
}

/// One row of the ledger tally aggregation.
#[derive(Debug, Deserialize)]
struct TallyRow {
    #[serde(rename = "_id")]
    key: TallyKey,
    count: u64,
}

#[derive(Debug, Deserialize)]
struct TallyKey {
    question_id: String,
    option_id: String,
}

#[rocket::async_trait]
impl VoteLedger for MongoStore {
    async fn insert_votes(&self, records: &[VoteRecord]) -> Result<Vec<InsertOutcome>> {
        // MongoDB rejects empty batches.
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let options = InsertManyOptions::builder().ordered(false).build();
        let err = match self.votes.insert_many(records, options).await {
            Ok(_) => return Ok(vec![InsertOutcome::Inserted; records.len()]),
            Err(err) => err,
        };

        // An unordered insert writes everything it can; only the listed
        // indices failed.
        let failures = match bulk_write_failures(&err) {
            Some(failures) => failures,
            None => return Err(err.into()),
        };
        let mut outcomes = vec![InsertOutcome::Inserted; records.len()];
        for (index, code, message) in failures {
            if let Some(outcome) = outcomes.get_mut(index) {
                *outcome = if code == DUPLICATE_KEY {
                    InsertOutcome::Duplicate
                } else {
                    InsertOutcome::Failed(message)
                };
            }
        }
        Ok(outcomes)
    }

    async fn has_voted(
        &self,
        session_id: Id,
        question_id: &str,
        participant_id: &ParticipantId,
    ) -> Result<bool> {
        let filter = doc! {
            "session_id": session_id,
            "question_id": question_id,
            "participant_id": participant_id.as_str(),
        };
        Ok(self.votes.find_one(filter, None).await?.is_some())
    }

    async fn has_voted_option(
        &self,
        session_id: Id,
        question_id: &str,
        option_id: &str,
        participant_id: &ParticipantId,
    ) -> Result<bool> {
        let filter = doc! {
            "session_id": session_id,
            "question_id": question_id,
            "option_id": option_id,
            "participant_id": participant_id.as_str(),
        };
        Ok(self.votes.find_one(filter, None).await?.is_some())
    }

    async fn has_any_vote(&self, session_id: Id, participant_id: &ParticipantId) -> Result<bool> {
        let filter = doc! {
            "session_id": session_id,
            "participant_id": participant_id.as_str(),
        };
        Ok(self.votes.find_one(filter, None).await?.is_some())
    }

    async fn tally(&self, session_id: Id) -> Result<LedgerTally> {
        let pipeline = vec![
            doc! { "$match": { "session_id": session_id } },
            doc! {
                "$group": {
                    "_id": { "question_id": "$question_id", "option_id": "$option_id" },
                    "count": { "$sum": 1 },
                }
            },
        ];
        let mut tally = LedgerTally::default();
        let mut cursor = self.votes.aggregate(pipeline, None).await?;
        while let Some(row) = cursor.try_next().await? {
            let row: TallyRow =
                bson::from_document(row).map_err(|e| Error::Unavailable(e.to_string()))?;
            tally
                .votes
                .insert((row.key.question_id, row.key.option_id), row.count);
        }

        let participants = self
            .votes
            .distinct("participant_id", doc! { "session_id": session_id }, None)
            .await?;
        tally.participants = participants.len() as u64;
        Ok(tally)
    }
}

/// A fresh, randomly named database with every index in place, on the
/// server configured as `db_uri`.
#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    let db_uri: String = rocket::Config::figment()
        .extract_inner("db_uri")
        .expect("`db_uri` must be set for database tests");
    let client = mongodb::Client::with_uri_str(&db_uri)
        .await
        .expect("valid `db_uri`");
    let random: u32 = rand::random();
    let db = client.database(&format!("test{random}"));
    info!("Using database {}", db.name());
    crate::model::mongodb::ensure_indexes_exist(&db)
        .await
        .expect("indexes created");
    db
}
