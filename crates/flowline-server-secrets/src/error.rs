// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the secrets subsystem.

use thiserror::Error;

use crate::types::KeyId;

/// Result type alias for secrets operations.
pub type SecretsResult<T> = Result<T, SecretsError>;

/// Errors that can occur during secrets operations.
///
/// Corrupt envelopes and unknown keys are distinct from "not found": store
/// reads return `Ok(None)` for a missing secret and an error for one that
/// exists but cannot be read.
#[derive(Debug, Error)]
pub enum SecretsError {
	// =========================================================================
	// Configuration Errors
	// =========================================================================
	#[error("configuration error: {0}")]
	Configuration(String),

	// =========================================================================
	// Encryption Errors
	// =========================================================================
	#[error("unknown encryption key id: {0}")]
	UnknownKey(KeyId),

	#[error("encryption failed: {0}")]
	Encryption(String),

	#[error("decryption failed: {0}")]
	Decryption(String),

	// =========================================================================
	// Input Errors
	// =========================================================================
	#[error("invalid secret name: {0}")]
	InvalidSecretName(String),

	// =========================================================================
	// Infrastructure Errors
	// =========================================================================
	#[error("secret store unavailable: {0}")]
	StoreUnavailable(String),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("internal error: {0}")]
	Internal(String),
}

impl SecretsError {
	/// True when the backing store could not be reached or failed the query.
	pub fn is_store_unavailable(&self) -> bool {
		matches!(
			self,
			SecretsError::StoreUnavailable(_) | SecretsError::Database(_)
		)
	}

	/// Returns true if this error should be logged at error level.
	pub fn is_internal(&self) -> bool {
		matches!(
			self,
			SecretsError::Database(_)
				| SecretsError::StoreUnavailable(_)
				| SecretsError::Internal(_)
				| SecretsError::Configuration(_)
				| SecretsError::Encryption(_)
		)
	}
}
