use thiserror::Error;

use super::BoxFuture;
use crate::search::{SearchRequest, SearchResults};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    Unavailable(String),
    #[error("index request failed: {0}")]
    Request(String),
    #[error("index rejected request (status {status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Full-text index over message documents.
pub trait MessageIndex: Send + Sync {
    /// Create the index with its analyzers and mapping if it is missing.
    fn ensure_index(&self) -> BoxFuture<'_, Result<(), IndexError>>;

    /// Submit a prebuilt newline-delimited bulk body.
    fn bulk_write(&self, body: String) -> BoxFuture<'_, Result<(), IndexError>>;

    fn search(
        &self,
        request: &SearchRequest,
    ) -> BoxFuture<'_, Result<SearchResults, IndexError>>;

    fn ping(&self) -> BoxFuture<'_, Result<(), IndexError>>;
}
