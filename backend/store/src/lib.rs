pub mod adapter;
pub mod engine;
pub mod sqlite;

pub use adapter::RecordStore;
pub use engine::{Blob, DocumentStore};
pub use sqlite::SqliteDocumentStore;
