//! Error types for the collection store and tenant layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Payment rejected: {0}")]
    PaymentRejected(String),

    #[error("Payment verification failed: {0}")]
    Verification(String),

    #[error("Storage error: {0}")]
    Storage(#[from] heed::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PortalError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        PortalError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PortalError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, PortalError>;
