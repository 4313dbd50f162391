// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Core of the personal data server: permissioned compute over a
//! user's encrypted files.
//!
//! A grantee application submits an operation referencing an on-chain
//! permission. The pipeline verifies the grantee's signature against
//! the permission's on-chain grantee record, validates the
//! content-addressed grant file, derives the grantor's deterministic
//! server identity, fetches and decrypts the permitted files, and
//! dispatches to a compute provider: synchronous remote LLM inference
//! or a long-running agent CLI inside a sandbox runtime. Agent
//! artifacts are encrypted at rest and served back through a
//! signature-gated download path.

pub mod application;
pub mod bootstrap;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod identity;
pub mod infrastructure;
pub mod presentation;

pub use config::ServerConfig;
pub use domain::error::ServerError;
