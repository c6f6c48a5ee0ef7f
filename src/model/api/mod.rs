//! API-friendly (e.g. JSON) types.
//!
//! Field names are camelCase and IDs are plain strings.

pub mod join;
pub mod session;
pub mod vote;
