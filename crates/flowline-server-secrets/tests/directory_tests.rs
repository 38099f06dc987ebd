// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end tests: TOML config -> key ring -> SQLite store -> directory -> masker.

use std::io::Write;
use std::sync::Arc;

use flowline_common_secret::SecretString;
use flowline_server_secrets::{
	config::{ConfigSource, TomlSource},
	create_pool, generate_key, migrate, KeyRing, KeyRingHandle, KeySize, OutputMasker,
	SecretDirectory, SecretScope, SecretStore, SecretsError, SqliteSecretStore,
};
use serde_json::json;
use tempfile::{NamedTempFile, TempDir};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
		)
		.with_test_writer()
		.try_init();
}

struct Harness {
	_dir: TempDir,
	keyring: KeyRingHandle,
	directory: Arc<SecretDirectory<SqliteSecretStore>>,
}

async fn harness(ring: KeyRing) -> Harness {
	init_tracing();
	let dir = TempDir::new().unwrap();
	let url = format!("sqlite:{}", dir.path().join("secrets.db").display());
	let pool = create_pool(&url).await.unwrap();
	migrate(&pool).await.unwrap();

	let keyring = KeyRingHandle::new(ring);
	let store = Arc::new(SqliteSecretStore::new(pool, keyring.clone()));
	let directory = Arc::new(SecretDirectory::new(store, Default::default()));
	Harness {
		_dir: dir,
		keyring,
		directory,
	}
}

fn ring_from_toml(toml: &str) -> Result<KeyRing, SecretsError> {
	let mut file = NamedTempFile::new().unwrap();
	file.write_all(toml.as_bytes()).unwrap();
	let config = TomlSource::new(file.path()).load()?.finalize()?;
	KeyRing::from_config(&config.encryption)
}

async fn put(h: &Harness, name: &str, value: &str, scope: &SecretScope) {
	h.directory
		.put(name, &SecretString::from(value), "ops@example.com", "", scope)
		.await
		.unwrap();
}

#[tokio::test]
async fn enabled_config_without_keys_fails_before_any_encryption() {
	let result = ring_from_toml(
		r#"
[encryption]
enabled = true
active_key_id = "k1"
"#,
	);
	assert!(matches!(result, Err(SecretsError::Configuration(_))));
}

#[tokio::test]
async fn config_driven_ring_roundtrips_through_sqlite() {
	let k1 = generate_key(KeySize::Aes192).to_base64();
	let ring = ring_from_toml(&format!(
		r#"
[encryption]
enabled = true
active_key_id = "k1"

[encryption.keys]
k1 = "{}"
"#,
		k1.expose()
	))
	.unwrap();
	let h = harness(ring).await;

	put(&h, "DB_PASSWORD", "correct horse", &SecretScope::Global).await;
	let value = h
		.directory
		.get("DB_PASSWORD", &SecretScope::Global)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(value.expose(), "correct horse");
}

#[tokio::test]
async fn overlay_and_write_consistency() {
	let ring = KeyRing::new(
		"k1".into(),
		[("k1".into(), generate_key(KeySize::Aes256))],
	)
	.unwrap();
	let h = harness(ring).await;
	let wf = SecretScope::workflow("nightly-etl");

	put(&h, "a", "1", &SecretScope::Global).await;
	put(&h, "b", "2", &SecretScope::Global).await;
	put(&h, "b", "3", &wf).await;
	put(&h, "c", "4", &wf).await;

	let merged = h.directory.secrets_for_scope(Some("nightly-etl")).await;
	let view: Vec<_> = merged.iter().map(|(k, v)| (k.as_str(), v.expose().as_str())).collect();
	assert_eq!(view, vec![("a", "1"), ("b", "3"), ("c", "4")]);

	// Cached now; a write must still be visible on the very next read.
	put(&h, "a", "changed", &SecretScope::Global).await;
	let merged = h.directory.secrets_for_scope(Some("nightly-etl")).await;
	assert_eq!(merged["a"].expose(), "changed");

	h.directory.delete("c", &wf).await.unwrap();
	let merged = h.directory.secrets_for_scope(Some("nightly-etl")).await;
	assert!(!merged.contains_key("c"));
	assert_eq!(
		h.directory.list_names(&wf).await.unwrap(),
		vec!["b".to_string()]
	);
}

#[tokio::test]
async fn masking_after_key_rotation() {
	let k1 = generate_key(KeySize::Aes256);
	let k2 = generate_key(KeySize::Aes128);
	let h = harness(KeyRing::new("k1".into(), [("k1".into(), k1.clone())]).unwrap()).await;
	let wf = SecretScope::workflow("deploy");

	put(&h, "API_TOKEN", "tok-live-9f8e7d", &SecretScope::Global).await;
	put(&h, "DEPLOY_KEY", "dk-42", &wf).await;

	h.keyring.replace(
		KeyRing::new(
			"k2".into(),
			[("k1".into(), k1), ("k2".into(), k2.clone())],
		)
		.unwrap(),
	);
	h.directory.cache().invalidate_all();
	put(&h, "NEW_TOKEN", "new-tok-123", &wf).await;

	let masker = OutputMasker::new(Arc::clone(&h.directory));
	let output = json!({
		"stdout": "calling api with tok-live-9f8e7d and dk-42",
		"artifacts": [{"name": "new-tok-123", "size": 10}],
		"exitCode": 0
	});
	let masked = masker.mask_output(Some("deploy"), output).await;
	assert_eq!(
		masked,
		json!({
			"stdout": "calling api with *** and ***",
			"artifacts": [{"name": "***", "size": 10}],
			"exitCode": 0
		})
	);

	assert_eq!(h.directory.store().reencrypt_all().await.unwrap(), 2);
	h.keyring
		.replace(KeyRing::new("k2".into(), [("k2".into(), k2)]).unwrap());
	let value = h
		.directory
		.store()
		.get("API_TOKEN", &SecretScope::Global)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(value.expose(), "tok-live-9f8e7d");
}

#[tokio::test]
async fn removed_key_degrades_masking_but_surfaces_on_get() {
	let h = harness(
		KeyRing::new("k1".into(), [("k1".into(), generate_key(KeySize::Aes256))]).unwrap(),
	)
	.await;
	put(&h, "PW", "s3cr3t", &SecretScope::Global).await;

	h.keyring.replace(
		KeyRing::new("k2".into(), [("k2".into(), generate_key(KeySize::Aes256))]).unwrap(),
	);
	h.directory.cache().invalidate_all();

	assert!(matches!(
		h.directory.get("PW", &SecretScope::Global).await,
		Err(SecretsError::UnknownKey(_))
	));

	let masker = OutputMasker::new(Arc::clone(&h.directory));
	let output = json!({"log": "s3cr3t"});
	assert_eq!(masker.mask_output(None, output.clone()).await, output);
}
