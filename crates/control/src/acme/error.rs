//! ACME error types

use std::io;
use thiserror::Error;

use warden_common::WardenError;

use super::dns::DnsProviderError;

/// Errors from ACME operations
#[derive(Debug, Error)]
pub enum AcmeError {
    /// Failed to create or load the ACME account
    #[error("Failed to create ACME account: {0}")]
    AccountCreation(String),

    /// Failed to create a certificate order
    #[error("Failed to create certificate order: {0}")]
    OrderCreation(String),

    /// Challenge validation failed
    #[error("Challenge validation failed for domain '{domain}': {message}")]
    ChallengeValidation { domain: String, message: String },

    /// The authorization offered no DNS-01 challenge
    #[error("No DNS-01 challenge available for domain '{0}'")]
    NoDns01Challenge(String),

    /// Certificate finalization failed
    #[error("Failed to finalize certificate: {0}")]
    Finalization(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// ACME protocol error from instant-acme
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// DNS provider operation failed
    #[error("DNS provider error: {0}")]
    DnsProvider(#[from] DnsProviderError),

    /// Certificate parsing failed
    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),
}

/// Errors from certificate and account persistence
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize data
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No certificate installed for the domain
    #[error("Certificate not found for domain: {domain}")]
    CertificateNotFound { domain: String },
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

impl From<AcmeError> for WardenError {
    fn from(e: AcmeError) -> Self {
        WardenError::protocol("acme", e.to_string())
    }
}
