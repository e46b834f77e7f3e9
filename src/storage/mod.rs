// Paged durable storage.

mod page_store;

pub use page_store::{CommitRecord, PageStore, ENCODING_VERSION};
