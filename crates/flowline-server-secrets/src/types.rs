// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core type definitions for secrets management.
//!
//! - **KeyId**: identifier of a symmetric key in the key ring
//! - **SecretScope**: global or workflow-scoped namespace
//! - **SecretRecord / SecretMetadata**: storage-side shapes (never plaintext)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::envelope::EncryptedEnvelope;
use crate::error::{SecretsError, SecretsResult};

/// Longest accepted secret or workflow name.
pub const MAX_NAME_LEN: usize = 255;

// =============================================================================
// Key Id
// =============================================================================

/// Identifier of a configured encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn as_bytes(&self) -> &[u8] {
		self.0.as_bytes()
	}
}

impl fmt::Display for KeyId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for KeyId {
	fn from(id: &str) -> Self {
		Self::new(id)
	}
}

// =============================================================================
// Secret Scope
// =============================================================================

/// The namespace a secret lives in.
///
/// A global secret and a workflow-scoped secret may share a name; the pair
/// `(name, scope)` identifies a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretScope {
	/// Visible to every workflow.
	Global,
	/// Visible only to executions of the named workflow definition.
	Workflow { name: String },
}

impl SecretScope {
	pub fn workflow(name: impl Into<String>) -> Self {
		SecretScope::Workflow { name: name.into() }
	}

	/// Map an optional workflow name onto a scope; `None` is global.
	pub fn from_workflow(workflow_name: Option<&str>) -> Self {
		match workflow_name {
			Some(name) => SecretScope::workflow(name),
			None => SecretScope::Global,
		}
	}

	/// Storage discriminator.
	pub fn as_str(&self) -> &'static str {
		match self {
			SecretScope::Global => "global",
			SecretScope::Workflow { .. } => "workflow",
		}
	}

	pub fn workflow_name(&self) -> Option<&str> {
		match self {
			SecretScope::Global => None,
			SecretScope::Workflow { name } => Some(name),
		}
	}

	pub fn is_global(&self) -> bool {
		matches!(self, SecretScope::Global)
	}

	/// Rebuild a scope from its stored columns.
	pub(crate) fn from_columns(scope: &str, workflow_name: &str) -> SecretsResult<Self> {
		match scope {
			"global" => Ok(SecretScope::Global),
			"workflow" => Ok(SecretScope::workflow(workflow_name)),
			other => Err(SecretsError::Internal(format!(
				"unknown scope type in store: {other}"
			))),
		}
	}
}

impl fmt::Display for SecretScope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SecretScope::Global => f.write_str("global"),
			SecretScope::Workflow { name } => write!(f, "workflow:{name}"),
		}
	}
}

// =============================================================================
// Records
// =============================================================================

/// A stored secret: metadata plus its encrypted envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct SecretRecord {
	pub name: String,
	pub scope: SecretScope,
	pub envelope: EncryptedEnvelope,
	pub created_by: String,
	pub description: String,
	pub created_at: DateTime<Utc>,
	pub modified_at: DateTime<Utc>,
}

/// Secret metadata without the envelope; safe to list and log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMetadata {
	pub name: String,
	pub scope: SecretScope,
	pub key_id: KeyId,
	pub created_by: String,
	pub description: String,
	pub created_at: DateTime<Utc>,
	pub modified_at: DateTime<Utc>,
}

impl From<&SecretRecord> for SecretMetadata {
	fn from(record: &SecretRecord) -> Self {
		Self {
			name: record.name.clone(),
			scope: record.scope.clone(),
			key_id: record.envelope.key_id.clone(),
			created_by: record.created_by.clone(),
			description: record.description.clone(),
			created_at: record.created_at,
			modified_at: record.modified_at,
		}
	}
}

// =============================================================================
// Validation
// =============================================================================

/// Reject blank or oversized secret names and workflow names.
pub fn validate_name(name: &str, scope: &SecretScope) -> SecretsResult<()> {
	check_name("secret name", name)?;
	if let Some(workflow) = scope.workflow_name() {
		check_name("workflow name", workflow)?;
	}
	Ok(())
}

fn check_name(what: &str, value: &str) -> SecretsResult<()> {
	if value.trim().is_empty() {
		return Err(SecretsError::InvalidSecretName(format!(
			"{what} must not be blank"
		)));
	}
	if value.chars().count() > MAX_NAME_LEN {
		return Err(SecretsError::InvalidSecretName(format!(
			"{what} must be at most {MAX_NAME_LEN} characters"
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	mod secret_scope {
		use super::*;

		#[test]
		fn none_maps_to_global() {
			assert_eq!(SecretScope::from_workflow(None), SecretScope::Global);
			assert_eq!(
				SecretScope::from_workflow(Some("billing")),
				SecretScope::workflow("billing")
			);
		}

		#[test]
		fn display_format() {
			assert_eq!(SecretScope::Global.to_string(), "global");
			assert_eq!(SecretScope::workflow("etl").to_string(), "workflow:etl");
		}

		#[test]
		fn serializes_with_tag() {
			let json = serde_json::to_string(&SecretScope::workflow("etl")).unwrap();
			assert_eq!(json, r#"{"type":"workflow","name":"etl"}"#);
			let json = serde_json::to_string(&SecretScope::Global).unwrap();
			assert_eq!(json, r#"{"type":"global"}"#);
		}

		#[test]
		fn columns_roundtrip() {
			for scope in [SecretScope::Global, SecretScope::workflow("etl")] {
				let rebuilt =
					SecretScope::from_columns(scope.as_str(), scope.workflow_name().unwrap_or(""))
						.unwrap();
				assert_eq!(rebuilt, scope);
			}
			assert!(SecretScope::from_columns("tenant", "").is_err());
		}
	}

	mod validation {
		use super::*;

		#[test]
		fn accepts_ordinary_names() {
			assert!(validate_name("API_KEY", &SecretScope::Global).is_ok());
			assert!(validate_name("db.password", &SecretScope::workflow("etl-nightly")).is_ok());
		}

		#[test]
		fn rejects_blank_names() {
			assert!(matches!(
				validate_name("  ", &SecretScope::Global),
				Err(SecretsError::InvalidSecretName(_))
			));
			assert!(validate_name("TOKEN", &SecretScope::workflow("")).is_err());
		}

		#[test]
		fn rejects_oversized_names() {
			let long = "x".repeat(MAX_NAME_LEN + 1);
			assert!(validate_name(&long, &SecretScope::Global).is_err());
			assert!(validate_name(&"x".repeat(MAX_NAME_LEN), &SecretScope::Global).is_ok());
		}
	}
}
