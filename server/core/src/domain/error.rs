// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Error taxonomy shared by every layer.
//!
//! Infrastructure adapters translate their transport errors into these
//! variants at the component boundary; raw reqwest/bollard/alloy errors
//! never cross into the application layer.

use thiserror::Error;

/// Failure subtypes for content downloads, carried inside
/// [`ServerError::Content`] so callers can distinguish a dead gateway
/// from an oversized body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFailure {
    NotFound,
    Timeout,
    TooLarge,
    RateLimited,
    Transport,
}

impl ContentFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ContentFailure::NotFound => "content_not_found",
            ContentFailure::Timeout => "content_timeout",
            ContentFailure::TooLarge => "content_too_large",
            ContentFailure::RateLimited => "content_rate_limited",
            ContentFailure::Transport => "content_transport",
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Chain read failed: {0}")]
    Chain(String),

    #[error("Content fetch failed: {message}")]
    Content {
        failure: ContentFailure,
        message: String,
    },

    // Envelope MAC failures and padding/parse failures share this one
    // variant; callers must not be able to tell them apart.
    #[error("Decryption failed")]
    Decryption,

    #[error("Grant validation failed: {0}")]
    GrantValidation(String),

    #[error("Compute operation failed: {0}")]
    Compute(String),

    #[error("Sandbox runtime failed: {0}")]
    Sandbox(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ServerError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn content(failure: ContentFailure, message: impl Into<String>) -> Self {
        ServerError::Content {
            failure,
            message: message.into(),
        }
    }

    /// Short machine code surfaced in API error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::Validation(_) => "validation_error",
            ServerError::Authentication(_) => "authentication_error",
            ServerError::Authorization(_) => "authorization_error",
            ServerError::NotFound { .. } => "not_found",
            ServerError::Chain(_) => "chain_error",
            ServerError::Content { failure, .. } => failure.code(),
            ServerError::Decryption => "decryption_error",
            ServerError::GrantValidation(_) => "grant_validation_error",
            ServerError::Compute(_) => "compute_error",
            ServerError::Sandbox(_) => "sandbox_error",
            ServerError::Internal(_) => "internal_error",
        }
    }
}
