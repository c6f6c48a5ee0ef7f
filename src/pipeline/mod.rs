//! Vote ingestion and aggregation.
//!
//! A submission passes the [`AdmissionGate`], which records accepted votes in
//! the ledger and queues an [`AggregationEvent`] per vote. The [`Aggregator`]
//! drains the queue in bursts and applies coalesced increments to the
//! session counters. Clients get their answer before the counters move.

mod admission;
mod aggregator;
mod queue;
mod reconcile;

pub use admission::{find_open_session, Admission, AdmissionGate, Ballot, SkipReason};
pub use aggregator::{Aggregator, Batch, DrainReport, OptionKey, DEFAULT_DELAY};
pub use queue::{AggregationEvent, AggregationQueue, Appended};
pub use reconcile::reconcile;
