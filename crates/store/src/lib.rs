pub mod document;
pub mod error;
pub mod feed;
pub mod http;
pub mod memory;
pub mod record;

pub use document::{ConditionalWrite, DocumentStore, StoredDocument, Version};
pub use error::StoreError;
pub use feed::ChangeFeed;
pub use http::{HttpChangeFeed, HttpDocumentStore};
pub use memory::{MemoryChangeFeed, MemoryStore};
pub use record::{RecordStore, StoredRecord, Versioned};
