pub mod doc_store;
pub mod merge;
pub mod persistence;

pub use doc_store::{Document, DocumentStore, FlushOutcome, SyncPlan};
pub use persistence::{FlushPolicy, PersistenceGateway, Snapshot};
