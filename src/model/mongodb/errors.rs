//! The mongodb crate doesn't provide error code constants, nor a convenient
//! way of picking apart bulk write failures. This module fills in the gaps.

use mongodb::error::{Error as DbError, ErrorKind, WriteFailure};

pub const DUPLICATE_KEY: i32 = 11000;

/// Return true if the given error is a duplicate key write error.
pub fn is_duplicate_key_error(err: &DbError) -> bool {
    match *err.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref e)) => e.code == DUPLICATE_KEY,
        ErrorKind::BulkWrite(ref failure) => failure
            .write_errors
            .as_ref()
            .map(|errors| !errors.is_empty() && errors.iter().all(|e| e.code == DUPLICATE_KEY))
            .unwrap_or(false),
        _ => false,
    }
}

/// The per-document failures of an unordered bulk insert, as `(index, code, message)`.
///
/// Returns `None` if the error is not a plain bulk write failure, i.e. the
/// write as a whole failed and no per-document outcome is known.
pub fn bulk_write_failures(err: &DbError) -> Option<Vec<(usize, i32, String)>> {
    match *err.kind {
        ErrorKind::BulkWrite(ref failure) if failure.write_concern_error.is_none() => Some(
            failure
                .write_errors
                .iter()
                .flatten()
                .map(|e| (e.index, e.code, e.message.clone()))
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mongodb::{bson::doc, options::IndexOptions, Database, IndexModel};

    async fn unique_collection(db: &Database) -> mongodb::Collection<mongodb::bson::Document> {
        let coll = db.collection("uniques");
        let index = IndexModel::builder()
            .keys(doc! {"key": 1})
            .options(IndexOptions::builder().unique(true).build())
            .build();
        coll.create_index(index, None).await.unwrap();
        coll
    }

    #[db_test]
    async fn single_duplicate_is_recognised(db: Database) {
        let coll = unique_collection(&db).await;
        coll.insert_one(doc! {"key": 1}, None).await.unwrap();
        let err = coll.insert_one(doc! {"key": 1}, None).await.unwrap_err();
        assert!(is_duplicate_key_error(&err));
        assert!(bulk_write_failures(&err).is_none());
    }

    #[db_test]
    async fn bulk_failures_are_indexed(db: Database) {
        let coll = unique_collection(&db).await;
        coll.insert_one(doc! {"key": 2}, None).await.unwrap();
        let options = mongodb::options::InsertManyOptions::builder()
            .ordered(false)
            .build();
        let err = coll
            .insert_many(
                vec![doc! {"key": 1}, doc! {"key": 2}, doc! {"key": 3}, doc! {"key": 1}],
                options,
            )
            .await
            .unwrap_err();

        assert!(is_duplicate_key_error(&err));
        let failures: Vec<_> = bulk_write_failures(&err)
            .unwrap()
            .into_iter()
            .map(|(index, code, _)| (index, code))
            .collect();
        assert_eq!(failures, vec![(1, DUPLICATE_KEY), (3, DUPLICATE_KEY)]);
        assert_eq!(coll.count_documents(None, None).await.unwrap(), 3);
    }
}
