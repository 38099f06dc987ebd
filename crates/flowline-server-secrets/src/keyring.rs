// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Symmetric key ring.
//!
//! A [`KeyRing`] maps key ids to raw AES key bytes and names the active key
//! used for new encryptions. Rings are immutable; configuration reloads build
//! a fresh ring and swap it into a [`KeyRingHandle`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flowline_common_secret::{SecretBytes, SecretString};
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use tracing::{info, warn};

use crate::config::EncryptionConfig;
use crate::error::{SecretsError, SecretsResult};
use crate::types::KeyId;

/// Supported AES key sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySize {
	Aes128,
	Aes192,
	Aes256,
}

impl KeySize {
	/// Key length in bytes.
	pub fn byte_len(self) -> usize {
		match self {
			KeySize::Aes128 => 16,
			KeySize::Aes192 => 24,
			KeySize::Aes256 => 32,
		}
	}

	pub fn bits(self) -> usize {
		self.byte_len() * 8
	}

	fn from_len(len: usize) -> Option<Self> {
		match len {
			16 => Some(KeySize::Aes128),
			24 => Some(KeySize::Aes192),
			32 => Some(KeySize::Aes256),
			_ => None,
		}
	}
}

// =============================================================================
// Key Material
// =============================================================================

/// Raw AES key bytes. Zeroized on drop, redacted when formatted.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
	bytes: SecretBytes,
	size: KeySize,
}

impl KeyMaterial {
	/// Wrap raw bytes; only 128, 192 and 256-bit keys are accepted.
	pub fn new(bytes: Vec<u8>) -> SecretsResult<Self> {
		let len = bytes.len();
		let bytes = SecretBytes::new(bytes);
		let size = KeySize::from_len(len).ok_or_else(|| {
			SecretsError::Configuration(format!(
				"key must be 128, 192 or 256 bits, got {} bits",
				len * 8
			))
		})?;
		Ok(Self { bytes, size })
	}

	/// Decode standard base64.
	pub fn from_base64(encoded: &SecretString) -> SecretsResult<Self> {
		let decoded = BASE64
			.decode(encoded.expose().trim())
			.map_err(|e| SecretsError::Configuration(format!("key is not valid base64: {e}")))?;
		Self::new(decoded)
	}

	pub fn to_base64(&self) -> SecretString {
		SecretString::new(BASE64.encode(self.bytes.expose()))
	}

	pub fn size(&self) -> KeySize {
		self.size
	}

	pub(crate) fn expose(&self) -> &[u8] {
		self.bytes.expose()
	}
}

impl fmt::Debug for KeyMaterial {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyMaterial")
			.field("size", &self.size)
			.field("bytes", &self.bytes)
			.finish()
	}
}

/// Generate fresh random key material.
pub fn generate_key(size: KeySize) -> KeyMaterial {
	let mut bytes = vec![0u8; size.byte_len()];
	OsRng.fill_bytes(&mut bytes);
	KeyMaterial {
		bytes: SecretBytes::new(bytes),
		size,
	}
}

// =============================================================================
// Key Ring
// =============================================================================

/// The set of configured keys plus the active key id.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
	active: Option<KeyId>,
	keys: HashMap<KeyId, KeyMaterial>,
}

impl KeyRing {
	/// Build an enabled ring. The active id must be non-blank and present.
	pub fn new(
		active_key_id: KeyId,
		keys: impl IntoIterator<Item = (KeyId, KeyMaterial)>,
	) -> SecretsResult<Self> {
		let keys: HashMap<KeyId, KeyMaterial> = keys.into_iter().collect();

		if active_key_id.as_str().trim().is_empty() {
			return Err(SecretsError::Configuration(
				"active key id must be set when encryption is enabled".to_string(),
			));
		}
		if keys.is_empty() {
			return Err(SecretsError::Configuration(
				"at least one encryption key must be configured".to_string(),
			));
		}
		if !keys.contains_key(&active_key_id) {
			return Err(SecretsError::Configuration(format!(
				"active key id {active_key_id} is not among the configured keys"
			)));
		}

		Ok(Self {
			active: Some(active_key_id),
			keys,
		})
	}

	/// A ring with no keys. Encryption and decryption always fail.
	pub fn disabled() -> Self {
		Self::default()
	}

	/// Validate an encryption config and build the ring it describes.
	pub fn from_config(config: &EncryptionConfig) -> SecretsResult<Self> {
		if !config.enabled {
			info!("secret encryption disabled; key ring is empty");
			return Ok(Self::disabled());
		}

		let active = config
			.active_key_id
			.as_deref()
			.filter(|id| !id.trim().is_empty())
			.ok_or_else(|| {
				SecretsError::Configuration(
					"active key id must be set when encryption is enabled".to_string(),
				)
			})?;

		let mut keys = HashMap::with_capacity(config.keys.len());
		for (id, encoded) in &config.keys {
			let material = KeyMaterial::from_base64(encoded).map_err(|e| match e {
				SecretsError::Configuration(msg) => {
					SecretsError::Configuration(format!("key {id}: {msg}"))
				}
				other => other,
			})?;
			keys.insert(KeyId::new(id.as_str()), material);
		}

		let ring = Self::new(KeyId::new(active), keys)?;
		info!(
			active_key_id = %active,
			key_count = ring.keys.len(),
			"secret key ring loaded"
		);
		Ok(ring)
	}

	pub fn is_enabled(&self) -> bool {
		self.active.is_some()
	}

	pub fn active_key_id(&self) -> Option<&KeyId> {
		self.active.as_ref()
	}

	/// The key used for new encryptions.
	pub fn active_key(&self) -> SecretsResult<(&KeyId, &KeyMaterial)> {
		let id = self.active.as_ref().ok_or_else(|| {
			SecretsError::Encryption("secret encryption is disabled".to_string())
		})?;
		let key = self
			.keys
			.get(id)
			.ok_or_else(|| SecretsError::UnknownKey(id.clone()))?;
		Ok((id, key))
	}

	/// Resolve any present key, active or retired.
	pub fn resolve(&self, id: &KeyId) -> SecretsResult<&KeyMaterial> {
		self.keys
			.get(id)
			.ok_or_else(|| SecretsError::UnknownKey(id.clone()))
	}

	pub fn contains(&self, id: &KeyId) -> bool {
		self.keys.contains_key(id)
	}

	pub fn key_ids(&self) -> impl Iterator<Item = &KeyId> {
		self.keys.keys()
	}
}

// =============================================================================
// Key Ring Handle
// =============================================================================

/// Shared reference to the live key ring.
///
/// Readers take a cheap `Arc` snapshot; reloads swap the whole ring.
#[derive(Clone)]
pub struct KeyRingHandle {
	inner: Arc<RwLock<Arc<KeyRing>>>,
}

impl KeyRingHandle {
	pub fn new(ring: KeyRing) -> Self {
		Self {
			inner: Arc::new(RwLock::new(Arc::new(ring))),
		}
	}

	pub fn current(&self) -> Arc<KeyRing> {
		Arc::clone(&self.inner.read())
	}

	/// Swap in a freshly built ring.
	pub fn replace(&self, ring: KeyRing) {
		let mut guard = self.inner.write();
		if guard.active_key_id() != ring.active_key_id() {
			warn!(
				previous = ?guard.active_key_id().map(KeyId::as_str),
				active = ?ring.active_key_id().map(KeyId::as_str),
				"active encryption key changed"
			);
		}
		*guard = Arc::new(ring);
	}
}

impl fmt::Debug for KeyRingHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("KeyRingHandle").field(&self.current()).finish()
	}
}

impl From<KeyRing> for KeyRingHandle {
	fn from(ring: KeyRing) -> Self {
		Self::new(ring)
	}
}
