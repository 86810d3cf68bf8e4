//! Query pipeline errors

use skein_core::ValidationError;
use skein_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("codegen error: {0}")]
    Codegen(String),

    #[error("query deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Store(#[from] StoreError),
}
