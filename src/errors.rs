// Error types and error handling module
// This file defines the domain error enum shared across the gateway and
// control-plane components
//
// Numan Thabit 2025 Nov

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("bus error: {0}")]
    Bus(String),
    #[error("clustering error: {0}")]
    Clustering(String),
    #[error("policy error: {0}")]
    Policy(String),
}
