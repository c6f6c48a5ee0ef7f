mod bson;
mod collection;
mod errors;

pub use bson::Id;
pub use collection::{ensure_indexes_exist, Coll, MongoCollection};
pub use errors::{bulk_write_failures, is_duplicate_key_error, DUPLICATE_KEY};
