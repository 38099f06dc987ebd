// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Secret storage with SQLite backend.
//!
//! Values are encrypted with the live key ring before they reach the
//! database and decrypted on the way out. This module handles:
//! - The [`SecretStore`] contract shared by every backing implementation
//! - Upsert, lookup, listing and deletion per scope
//! - Metadata queries that never decrypt
//! - Re-encryption of records written under retired keys

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_common_secret::SecretString;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{debug, error, info, instrument, warn};

use crate::envelope::{self, EncryptedEnvelope};
use crate::error::{SecretsError, SecretsResult};
use crate::keyring::{KeyRing, KeyRingHandle};
use crate::types::{validate_name, KeyId, SecretMetadata, SecretRecord, SecretScope};

/// Decrypted secrets of one scope, keyed by name.
pub type SecretMap = BTreeMap<String, SecretString>;

/// Trait for secret storage operations.
///
/// Every operation is keyed by `(name, scope)`. Missing secrets are `Ok(None)`
/// or `false`; secrets that exist but cannot be decrypted are errors.
#[async_trait]
pub trait SecretStore: Send + Sync {
	/// Encrypt and upsert a secret. Overwrites value, creator, description
	/// and modification time of an existing record.
	async fn put(
		&self,
		name: &str,
		value: &SecretString,
		created_by: &str,
		description: &str,
		scope: &SecretScope,
	) -> SecretsResult<()>;

	/// Decrypt a single secret.
	async fn get(&self, name: &str, scope: &SecretScope) -> SecretsResult<Option<SecretString>>;

	/// Remove a secret. Removing a missing secret is not an error.
	async fn delete(&self, name: &str, scope: &SecretScope) -> SecretsResult<()>;

	/// Names in the scope, sorted lexicographically.
	async fn list_names(&self, scope: &SecretScope) -> SecretsResult<Vec<String>>;

	/// Decrypt every secret in the scope. Fails as a whole if any one
	/// record cannot be decrypted.
	async fn get_all(&self, scope: &SecretScope) -> SecretsResult<SecretMap>;

	async fn exists(&self, name: &str, scope: &SecretScope) -> SecretsResult<bool>;
}

/// SQLite implementation of SecretStore.
#[derive(Clone)]
pub struct SqliteSecretStore {
	pool: SqlitePool,
	keyring: KeyRingHandle,
}

impl SqliteSecretStore {
	pub fn new(pool: SqlitePool, keyring: KeyRingHandle) -> Self {
		Self { pool, keyring }
	}

	pub fn keyring(&self) -> &KeyRingHandle {
		&self.keyring
	}

	/// Metadata for one secret, without decrypting it.
	#[instrument(skip(self), fields(name = %name, scope = %scope))]
	pub async fn describe(
		&self,
		name: &str,
		scope: &SecretScope,
	) -> SecretsResult<Option<SecretMetadata>> {
		Ok(self
			.fetch_record(name, scope)
			.await?
			.as_ref()
			.map(SecretMetadata::from))
	}

	/// Metadata for every secret in the scope, sorted by name.
	#[instrument(skip(self), fields(scope = %scope))]
	pub async fn list_metadata(&self, scope: &SecretScope) -> SecretsResult<Vec<SecretMetadata>> {
		let records = self.fetch_scope(scope).await?;
		Ok(records.iter().map(SecretMetadata::from).collect())
	}

	/// Rewrite every envelope not under the active key with the active key.
	///
	/// Returns the number of records moved. Records changed concurrently are
	/// skipped and picked up by the next run. Records that cannot be read or
	/// decrypted are logged and skipped; the rest are still moved. Database
	/// errors abort the run.
	#[instrument(skip(self))]
	pub async fn reencrypt_all(&self) -> SecretsResult<u64> {
		let ring = self.keyring.current();
		let (active, _) = ring.active_key()?;

		let rows = sqlx::query(
			r#"
			SELECT secret_name, scope, workflow_name, secret_value, created_by,
			       description, created_at, modified_at
			FROM secrets
			ORDER BY scope, workflow_name, secret_name
			"#,
		)
		.fetch_all(&self.pool)
		.await?;

		let mut moved = 0u64;
		let mut skipped = 0u64;
		for row in rows {
			let stored: String = row.get("secret_value");
			let name: String = row.get("secret_name");
			let (record, rewrapped) = match rewrap(&row, &ring, active) {
				Ok(Some(rewrapped)) => rewrapped,
				Ok(None) => continue,
				Err(e) => {
					error!(name = %name, error = %e, "secret could not be re-encrypted, skipping");
					skipped += 1;
					continue;
				}
			};

			let result = sqlx::query(
				r#"
				UPDATE secrets
				SET secret_value = ?
				WHERE secret_name = ? AND scope = ? AND workflow_name = ? AND secret_value = ?
				"#,
			)
			.bind(&rewrapped)
			.bind(&record.name)
			.bind(record.scope.as_str())
			.bind(record.scope.workflow_name().unwrap_or(""))
			.bind(&stored)
			.execute(&self.pool)
			.await?;

			if result.rows_affected() == 1 {
				debug!(
					name = %record.name,
					scope = %record.scope,
					from_key = %record.envelope.key_id,
					to_key = %active,
					"re-encrypted secret"
				);
				moved += 1;
			}
		}

		if moved > 0 || skipped > 0 {
			warn!(
				count = moved,
				skipped,
				active_key_id = %active,
				"secrets re-encrypted under active key"
			);
		}
		Ok(moved)
	}

	async fn fetch_record(
		&self,
		name: &str,
		scope: &SecretScope,
	) -> SecretsResult<Option<SecretRecord>> {
		let row = sqlx::query(
			r#"
			SELECT secret_name, scope, workflow_name, secret_value, created_by,
			       description, created_at, modified_at
			FROM secrets
			WHERE secret_name = ? AND scope = ? AND workflow_name = ?
			"#,
		)
		.bind(name)
		.bind(scope.as_str())
		.bind(scope.workflow_name().unwrap_or(""))
		.fetch_optional(&self.pool)
		.await?;

		row.as_ref().map(parse_secret_row).transpose()
	}

	async fn fetch_scope(&self, scope: &SecretScope) -> SecretsResult<Vec<SecretRecord>> {
		let rows = sqlx::query(
			r#"
			SELECT secret_name, scope, workflow_name, secret_value, created_by,
			       description, created_at, modified_at
			FROM secrets
			WHERE scope = ? AND workflow_name = ?
			ORDER BY secret_name
			"#,
		)
		.bind(scope.as_str())
		.bind(scope.workflow_name().unwrap_or(""))
		.fetch_all(&self.pool)
		.await?;

		rows.iter().map(parse_secret_row).collect()
	}
}

#[async_trait]
impl SecretStore for SqliteSecretStore {
	#[instrument(skip(self, value, description), fields(name = %name, scope = %scope))]
	async fn put(
		&self,
		name: &str,
		value: &SecretString,
		created_by: &str,
		description: &str,
		scope: &SecretScope,
	) -> SecretsResult<()> {
		validate_name(name, scope)?;

		let ring = self.keyring.current();
		let envelope = envelope::encrypt(value.expose(), &ring)?;
		let now = Utc::now().to_rfc3339();

		sqlx::query(
			r#"
			INSERT INTO secrets (
				secret_name, scope, workflow_name, secret_value, created_by,
				description, created_at, modified_at
			) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
			ON CONFLICT (secret_name, scope, workflow_name) DO UPDATE SET
				secret_value = excluded.secret_value,
				created_by = excluded.created_by,
				description = excluded.description,
				modified_at = excluded.modified_at
			"#,
		)
		.bind(name)
		.bind(scope.as_str())
		.bind(scope.workflow_name().unwrap_or(""))
		.bind(envelope.to_json()?)
		.bind(created_by)
		.bind(description)
		.bind(&now)
		.bind(&now)
		.execute(&self.pool)
		.await?;

		info!(key_id = %envelope.key_id, "secret stored");
		Ok(())
	}

	#[instrument(skip(self), fields(name = %name, scope = %scope))]
	async fn get(&self, name: &str, scope: &SecretScope) -> SecretsResult<Option<SecretString>> {
		let Some(record) = self.fetch_record(name, scope).await? else {
			debug!("secret not found");
			return Ok(None);
		};

		let ring = self.keyring.current();
		envelope::decrypt(&record.envelope, &ring).map(Some)
	}

	#[instrument(skip(self), fields(name = %name, scope = %scope))]
	async fn delete(&self, name: &str, scope: &SecretScope) -> SecretsResult<()> {
		let result = sqlx::query(
			"DELETE FROM secrets WHERE secret_name = ? AND scope = ? AND workflow_name = ?",
		)
		.bind(name)
		.bind(scope.as_str())
		.bind(scope.workflow_name().unwrap_or(""))
		.execute(&self.pool)
		.await?;

		if result.rows_affected() == 0 {
			debug!("delete of missing secret ignored");
		} else {
			info!("secret deleted");
		}
		Ok(())
	}

	#[instrument(skip(self), fields(scope = %scope))]
	async fn list_names(&self, scope: &SecretScope) -> SecretsResult<Vec<String>> {
		let names = sqlx::query_scalar(
			r#"
			SELECT secret_name FROM secrets
			WHERE scope = ? AND workflow_name = ?
			ORDER BY secret_name
			"#,
		)
		.bind(scope.as_str())
		.bind(scope.workflow_name().unwrap_or(""))
		.fetch_all(&self.pool)
		.await?;
		Ok(names)
	}

	#[instrument(skip(self), fields(scope = %scope))]
	async fn get_all(&self, scope: &SecretScope) -> SecretsResult<SecretMap> {
		let records = self.fetch_scope(scope).await?;
		let ring = self.keyring.current();

		let mut secrets = SecretMap::new();
		for record in records {
			let value = envelope::decrypt(&record.envelope, &ring).map_err(|e| {
				error!(name = %record.name, error = %e, "secret in scope could not be decrypted");
				e
			})?;
			secrets.insert(record.name, value);
		}

		debug!(count = secrets.len(), "decrypted scope");
		Ok(secrets)
	}

	#[instrument(skip(self), fields(name = %name, scope = %scope))]
	async fn exists(&self, name: &str, scope: &SecretScope) -> SecretsResult<bool> {
		let found: Option<i64> = sqlx::query_scalar(
			"SELECT 1 FROM secrets WHERE secret_name = ? AND scope = ? AND workflow_name = ?",
		)
		.bind(name)
		.bind(scope.as_str())
		.bind(scope.workflow_name().unwrap_or(""))
		.fetch_optional(&self.pool)
		.await?;
		Ok(found.is_some())
	}
}

/// The record and its envelope re-sealed under `active`, or `None` if it is
/// already there.
fn rewrap(
	row: &SqliteRow,
	ring: &KeyRing,
	active: &KeyId,
) -> SecretsResult<Option<(SecretRecord, String)>> {
	let record = parse_secret_row(row)?;
	if &record.envelope.key_id == active {
		return Ok(None);
	}
	let plaintext = envelope::decrypt(&record.envelope, ring)?;
	let rewrapped = envelope::encrypt(plaintext.expose(), ring)?.to_json()?;
	Ok(Some((record, rewrapped)))
}

fn parse_secret_row(row: &SqliteRow) -> SecretsResult<SecretRecord> {
	let name: String = row.get("secret_name");
	let scope_str: String = row.get("scope");
	let workflow_name: String = row.get("workflow_name");
	let envelope_json: String = row.get("secret_value");
	let created_by: String = row.get("created_by");
	let description: String = row.get("description");
	let created_at_str: String = row.get("created_at");
	let modified_at_str: String = row.get("modified_at");

	Ok(SecretRecord {
		scope: SecretScope::from_columns(&scope_str, &workflow_name)?,
		envelope: EncryptedEnvelope::from_json(&envelope_json)?,
		created_at: parse_timestamp("created_at", &created_at_str)?,
		modified_at: parse_timestamp("modified_at", &modified_at_str)?,
		name,
		created_by,
		description,
	})
}

fn parse_timestamp(column: &str, value: &str) -> SecretsResult<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(value)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|e| SecretsError::Internal(format!("invalid {column}: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::keyring::{generate_key, KeyMaterial, KeySize};
	use crate::pool::{create_memory_pool, migrate};

	async fn create_test_pool() -> SqlitePool {
		let pool = create_memory_pool().await.unwrap();
		migrate(&pool).await.unwrap();
		pool
	}

	fn single_key_ring(id: &str, key: KeyMaterial) -> KeyRing {
		KeyRing::new(KeyId::new(id), [(KeyId::new(id), key)]).unwrap()
	}

	async fn create_test_store() -> SqliteSecretStore {
		let ring = single_key_ring("k1", generate_key(KeySize::Aes256));
		SqliteSecretStore::new(create_test_pool().await, KeyRingHandle::new(ring))
	}

	async fn put(store: &SqliteSecretStore, name: &str, value: &str, scope: &SecretScope) {
		store
			.put(name, &SecretString::from(value), "alice", "", scope)
			.await
			.unwrap();
	}

	async fn raw_value(store: &SqliteSecretStore, name: &str) -> String {
		sqlx::query_scalar("SELECT secret_value FROM secrets WHERE secret_name = ?")
			.bind(name)
			.fetch_one(&store.pool)
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn put_then_get_roundtrips() {
		let store = create_test_store().await;
		put(&store, "API_KEY", "sk-live-123", &SecretScope::Global).await;

		let value = store.get("API_KEY", &SecretScope::Global).await.unwrap();
		assert_eq!(value.unwrap().expose(), "sk-live-123");
		assert!(store.get("OTHER", &SecretScope::Global).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn plaintext_never_reaches_the_database() {
		let store = create_test_store().await;
		put(&store, "API_KEY", "sk-live-123", &SecretScope::Global).await;

		let stored = raw_value(&store, "API_KEY").await;
		assert!(!stored.contains("sk-live-123"));
		let envelope = EncryptedEnvelope::from_json(&stored).unwrap();
		assert_eq!(envelope.key_id, KeyId::new("k1"));
	}

	#[tokio::test]
	async fn scopes_are_isolated() {
		let store = create_test_store().await;
		let wf = SecretScope::workflow("wf");
		put(&store, "x", "v1", &SecretScope::Global).await;
		put(&store, "x", "v2", &wf).await;

		assert_eq!(
			store.get("x", &SecretScope::Global).await.unwrap().unwrap().expose(),
			"v1"
		);
		assert_eq!(store.get("x", &wf).await.unwrap().unwrap().expose(), "v2");
		assert!(!store.exists("x", &SecretScope::workflow("other")).await.unwrap());
	}

	#[tokio::test]
	async fn put_overwrites_existing_record() {
		let store = create_test_store().await;
		store
			.put("TOKEN", &SecretString::from("one"), "alice", "first", &SecretScope::Global)
			.await
			.unwrap();
		let before = store.describe("TOKEN", &SecretScope::Global).await.unwrap().unwrap();

		store
			.put("TOKEN", &SecretString::from("two"), "bob", "second", &SecretScope::Global)
			.await
			.unwrap();
		let after = store.describe("TOKEN", &SecretScope::Global).await.unwrap().unwrap();

		assert_eq!(
			store.get("TOKEN", &SecretScope::Global).await.unwrap().unwrap().expose(),
			"two"
		);
		assert_eq!(after.created_by, "bob");
		assert_eq!(after.description, "second");
		assert_eq!(after.created_at, before.created_at);
		assert!(after.modified_at >= before.modified_at);
		assert_eq!(store.list_names(&SecretScope::Global).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn delete_is_idempotent() {
		let store = create_test_store().await;
		put(&store, "x", "v", &SecretScope::Global).await;

		store.delete("x", &SecretScope::Global).await.unwrap();
		store.delete("x", &SecretScope::Global).await.unwrap();
		assert!(!store.exists("x", &SecretScope::Global).await.unwrap());
	}

	#[tokio::test]
	async fn delete_only_touches_its_scope() {
		let store = create_test_store().await;
		put(&store, "x", "global", &SecretScope::Global).await;
		put(&store, "x", "scoped", &SecretScope::workflow("wf")).await;

		store.delete("x", &SecretScope::workflow("wf")).await.unwrap();
		assert!(store.exists("x", &SecretScope::Global).await.unwrap());
	}

	#[tokio::test]
	async fn list_names_is_sorted_and_scoped() {
		let store = create_test_store().await;
		let wf = SecretScope::workflow("etl");
		for name in ["zeta", "alpha", "Mid", "beta"] {
			put(&store, name, "v", &wf).await;
		}
		put(&store, "global-only", "v", &SecretScope::Global).await;

		assert_eq!(
			store.list_names(&wf).await.unwrap(),
			vec!["Mid", "alpha", "beta", "zeta"]
		);
		assert_eq!(
			store.list_names(&SecretScope::Global).await.unwrap(),
			vec!["global-only"]
		);
	}

	#[tokio::test]
	async fn get_all_decrypts_scope() {
		let store = create_test_store().await;
		put(&store, "a", "1", &SecretScope::Global).await;
		put(&store, "b", "2", &SecretScope::Global).await;
		put(&store, "c", "3", &SecretScope::workflow("wf")).await;

		let all = store.get_all(&SecretScope::Global).await.unwrap();
		assert_eq!(all.len(), 2);
		assert_eq!(all["a"].expose(), "1");
		assert_eq!(all["b"].expose(), "2");
	}

	#[tokio::test]
	async fn corrupt_record_is_an_error_not_absent() {
		let store = create_test_store().await;
		put(&store, "good", "1", &SecretScope::Global).await;
		put(&store, "bad", "2", &SecretScope::Global).await;

		let mut envelope = EncryptedEnvelope::from_json(&raw_value(&store, "bad").await).unwrap();
		envelope.ciphertext[0] ^= 0x01;
		sqlx::query("UPDATE secrets SET secret_value = ? WHERE secret_name = 'bad'")
			.bind(envelope.to_json().unwrap())
			.execute(&store.pool)
			.await
			.unwrap();

		assert!(matches!(
			store.get("bad", &SecretScope::Global).await,
			Err(SecretsError::Decryption(_))
		));
		assert!(matches!(
			store.get_all(&SecretScope::Global).await,
			Err(SecretsError::Decryption(_))
		));
		assert!(store.get("good", &SecretScope::Global).await.unwrap().is_some());
	}

	#[tokio::test]
	async fn unreadable_json_is_decryption_failure() {
		let store = create_test_store().await;
		put(&store, "x", "1", &SecretScope::Global).await;
		sqlx::query("UPDATE secrets SET secret_value = 'plaintext-leftover'")
			.execute(&store.pool)
			.await
			.unwrap();

		assert!(matches!(
			store.get("x", &SecretScope::Global).await,
			Err(SecretsError::Decryption(_))
		));
	}

	#[tokio::test]
	async fn invalid_names_are_rejected_before_storage() {
		let store = create_test_store().await;
		let result = store
			.put(" ", &SecretString::from("v"), "alice", "", &SecretScope::Global)
			.await;
		assert!(matches!(result, Err(SecretsError::InvalidSecretName(_))));
		assert!(store.list_names(&SecretScope::Global).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn disabled_ring_refuses_writes() {
		let store = SqliteSecretStore::new(
			create_test_pool().await,
			KeyRingHandle::new(KeyRing::disabled()),
		);
		let result = store
			.put("x", &SecretString::from("v"), "alice", "", &SecretScope::Global)
			.await;
		assert!(matches!(result, Err(SecretsError::Encryption(_))));
		assert!(!store.exists("x", &SecretScope::Global).await.unwrap());
	}

	#[tokio::test]
	async fn rotation_and_reencryption() {
		let k1 = generate_key(KeySize::Aes256);
		let k2 = generate_key(KeySize::Aes256);
		let handle = KeyRingHandle::new(single_key_ring("k1", k1.clone()));
		let store = SqliteSecretStore::new(create_test_pool().await, handle.clone());

		put(&store, "old", "before-rotation", &SecretScope::Global).await;
		put(&store, "old", "scoped-before", &SecretScope::workflow("wf")).await;

		handle.replace(
			KeyRing::new(
				KeyId::new("k2"),
				[(KeyId::new("k1"), k1), (KeyId::new("k2"), k2.clone())],
			)
			.unwrap(),
		);
		put(&store, "new", "after-rotation", &SecretScope::Global).await;

		assert_eq!(
			store.get("old", &SecretScope::Global).await.unwrap().unwrap().expose(),
			"before-rotation"
		);
		let metadata = store.list_metadata(&SecretScope::Global).await.unwrap();
		let keys: Vec<_> = metadata.iter().map(|m| (m.name.as_str(), m.key_id.as_str())).collect();
		assert_eq!(keys, vec![("new", "k2"), ("old", "k1")]);

		assert_eq!(store.reencrypt_all().await.unwrap(), 2);
		assert_eq!(store.reencrypt_all().await.unwrap(), 0);

		handle.replace(single_key_ring("k2", k2));
		let all = store.get_all(&SecretScope::Global).await.unwrap();
		assert_eq!(all["old"].expose(), "before-rotation");
		assert_eq!(all["new"].expose(), "after-rotation");
		assert_eq!(
			store
				.get("old", &SecretScope::workflow("wf"))
				.await
				.unwrap()
				.unwrap()
				.expose(),
			"scoped-before"
		);
	}

	#[tokio::test]
	async fn reencryption_skips_unreadable_records() {
		let k1 = generate_key(KeySize::Aes256);
		let k2 = generate_key(KeySize::Aes256);
		let handle = KeyRingHandle::new(single_key_ring("k1", k1.clone()));
		let store = SqliteSecretStore::new(create_test_pool().await, handle.clone());

		put(&store, "a", "first", &SecretScope::Global).await;
		put(&store, "b", "broken", &SecretScope::Global).await;
		put(&store, "c", "last", &SecretScope::Global).await;

		let mut envelope = EncryptedEnvelope::from_json(&raw_value(&store, "b").await).unwrap();
		envelope.ciphertext[0] ^= 0x01;
		sqlx::query("UPDATE secrets SET secret_value = ? WHERE secret_name = 'b'")
			.bind(envelope.to_json().unwrap())
			.execute(&store.pool)
			.await
			.unwrap();

		handle.replace(
			KeyRing::new(
				KeyId::new("k2"),
				[(KeyId::new("k1"), k1), (KeyId::new("k2"), k2.clone())],
			)
			.unwrap(),
		);
		assert_eq!(store.reencrypt_all().await.unwrap(), 2);

		handle.replace(single_key_ring("k2", k2));
		for (name, value) in [("a", "first"), ("c", "last")] {
			assert_eq!(
				store.get(name, &SecretScope::Global).await.unwrap().unwrap().expose(),
				value
			);
		}
		let broken = EncryptedEnvelope::from_json(&raw_value(&store, "b").await).unwrap();
		assert_eq!(broken.key_id, KeyId::new("k1"));
	}

	#[tokio::test]
	async fn removed_key_is_unknown() {
		let handle = KeyRingHandle::new(single_key_ring("k1", generate_key(KeySize::Aes128)));
		let store = SqliteSecretStore::new(create_test_pool().await, handle.clone());
		put(&store, "x", "v", &SecretScope::Global).await;

		handle.replace(single_key_ring("k2", generate_key(KeySize::Aes128)));
		assert!(matches!(
			store.get("x", &SecretScope::Global).await,
			Err(SecretsError::UnknownKey(id)) if id == KeyId::new("k1")
		));
		assert!(store.describe("x", &SecretScope::Global).await.unwrap().is_some());
	}
}
