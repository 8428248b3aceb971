//! Durable knowledge store: entities, checkpoints, run records

mod schema;
mod store;

pub use store::{EntityRecord, KnowledgeStore, RunRecord};
