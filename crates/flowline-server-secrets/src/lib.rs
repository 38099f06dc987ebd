// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Workflow Secrets System
//!
//! This crate stores secrets for Flowline workflows and keeps them out of
//! task output:
//!
//! - **Envelope Encryption**: AES-GCM with the key id bound as associated data
//! - **Key Rotation**: old envelopes decrypt under retired keys still in the ring
//! - **Scoped Storage**: global secrets and per-workflow secrets
//! - **Read-Through Cache**: one load per scope at a time, cleared on every write
//! - **Output Masking**: secret values in task output are replaced with `***`
//!
//! # Security Design
//!
//! - All secret values use [`SecretString`](flowline_common_secret::SecretString)
//!   to prevent logging
//! - No plaintext fallback: a ring without keys refuses to encrypt
//! - Corrupt envelopes and unknown keys are errors, never "not found"

pub mod cache;
pub mod config;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod keyring;
pub mod masking;
pub mod pool;
pub mod store;
pub mod types;

pub use cache::{LoadResult, SecretCache};
pub use config::{
	load_config, load_config_with_file, CacheConfig, EncryptionConfig, SecretsConfig,
	SecretsConfigLayer,
};
pub use directory::SecretDirectory;
pub use envelope::{decrypt, encrypt, Algorithm, EncryptedEnvelope, ENVELOPE_VERSION, NONCE_SIZE};
pub use error::{SecretsError, SecretsResult};
pub use keyring::{generate_key, KeyMaterial, KeyRing, KeyRingHandle, KeySize};
pub use masking::{mask, mask_str, OutputMasker, SecretValues, MASK};
pub use pool::{create_memory_pool, create_pool, migrate};
pub use store::{SecretMap, SecretStore, SqliteSecretStore};
pub use types::{KeyId, SecretMetadata, SecretRecord, SecretScope};
