pub mod blob;
pub mod documents;
pub mod hash;
pub mod local;
pub mod metadata;
pub mod object_store;

pub use blob::{BlobStore, LocalBlobStore};
pub use documents::{Document, DocumentQuery, DocumentStore, LocalDocumentStore};
pub use hash::{compute_hash, document_id};
pub use local::{FileKeyValueStore, KeyValueStore, LocalPersistence};
pub use metadata::{MetadataStore, ReferenceUpdate};
pub use object_store::{Folder, ObjectStore, StorageStats, sanitize_file_name};
