// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Envelope encryption for secret values.
//!
//! Uses AES-GCM with a 96-bit random nonce and a 128-bit tag. The key id is
//! bound as associated data, so an envelope whose `keyId` has been swapped
//! fails authentication instead of decrypting under the wrong key.
//!
//! Persisted form:
//!
//! ```json
//! {"version":1,"keyId":"k2","algorithm":"AES256GCM","nonce":"<b64>","ciphertext":"<b64>"}
//! ```

use std::fmt;
use std::str::FromStr;

use aes_gcm::{
	aead::{consts::U12, generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
	Aes128Gcm, Aes256Gcm, AesGcm,
};
use flowline_common_secret::SecretString;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{SecretsError, SecretsResult};
use crate::keyring::{KeyMaterial, KeyRing, KeySize};
use crate::types::KeyId;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Size of AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, U12>;

// =============================================================================
// Algorithm
// =============================================================================

/// Self-describing algorithm tag carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
	Aes128Gcm,
	Aes192Gcm,
	Aes256Gcm,
}

impl Algorithm {
	pub fn for_key(size: KeySize) -> Self {
		match size {
			KeySize::Aes128 => Algorithm::Aes128Gcm,
			KeySize::Aes192 => Algorithm::Aes192Gcm,
			KeySize::Aes256 => Algorithm::Aes256Gcm,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Algorithm::Aes128Gcm => "AES128GCM",
			Algorithm::Aes192Gcm => "AES192GCM",
			Algorithm::Aes256Gcm => "AES256GCM",
		}
	}
}

impl fmt::Display for Algorithm {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Algorithm {
	type Err = SecretsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"AES128GCM" => Ok(Algorithm::Aes128Gcm),
			"AES192GCM" => Ok(Algorithm::Aes192Gcm),
			"AES256GCM" => Ok(Algorithm::Aes256Gcm),
			other => Err(SecretsError::Decryption(format!(
				"unsupported algorithm: {other}"
			))),
		}
	}
}

// =============================================================================
// Envelope
// =============================================================================

/// Encrypted secret value plus everything needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
	pub version: u8,
	pub key_id: KeyId,
	pub algorithm: String,
	#[serde(with = "base64_bytes")]
	pub nonce: Vec<u8>,
	/// Ciphertext with the authentication tag appended.
	#[serde(with = "base64_bytes")]
	pub ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
	pub fn to_json(&self) -> SecretsResult<String> {
		serde_json::to_string(self)
			.map_err(|e| SecretsError::Internal(format!("envelope serialization failed: {e}")))
	}

	/// Parse a stored envelope. Malformed input is a decryption failure.
	pub fn from_json(json: &str) -> SecretsResult<Self> {
		serde_json::from_str(json)
			.map_err(|e| SecretsError::Decryption(format!("malformed envelope: {e}")))
	}
}

mod base64_bytes {
	use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&BASE64.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let encoded = String::deserialize(deserializer)?;
		BASE64.decode(encoded).map_err(serde::de::Error::custom)
	}
}

// =============================================================================
// Cipher
// =============================================================================

/// Generate a random nonce.
///
/// A fresh 96-bit nonce from OsRng per call. The (key, nonce) pair must never
/// repeat; at realistic secret-write volumes random nonces stay far below the
/// 2^32 encryptions per key where collisions become a concern.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
	let mut nonce = [0u8; NONCE_SIZE];
	OsRng.fill_bytes(&mut nonce);
	nonce
}

/// Encrypt a plaintext under the ring's active key.
pub fn encrypt(plaintext: &str, ring: &KeyRing) -> SecretsResult<EncryptedEnvelope> {
	let (key_id, key) = ring.active_key()?;
	let algorithm = Algorithm::for_key(key.size());
	let nonce = generate_nonce();

	let payload = Payload {
		msg: plaintext.as_bytes(),
		aad: key_id.as_bytes(),
	};
	let ciphertext = match algorithm {
		Algorithm::Aes128Gcm => seal::<Aes128Gcm>(key, &nonce, payload),
		Algorithm::Aes192Gcm => seal::<Aes192Gcm>(key, &nonce, payload),
		Algorithm::Aes256Gcm => seal::<Aes256Gcm>(key, &nonce, payload),
	}?;

	Ok(EncryptedEnvelope {
		version: ENVELOPE_VERSION,
		key_id: key_id.clone(),
		algorithm: algorithm.as_str().to_string(),
		nonce: nonce.to_vec(),
		ciphertext,
	})
}

/// Decrypt an envelope with whichever ring key its `keyId` names.
pub fn decrypt(envelope: &EncryptedEnvelope, ring: &KeyRing) -> SecretsResult<SecretString> {
	if envelope.version != ENVELOPE_VERSION {
		return Err(SecretsError::Decryption(format!(
			"unsupported envelope version: {}",
			envelope.version
		)));
	}

	let key = ring.resolve(&envelope.key_id)?;
	let algorithm: Algorithm = envelope.algorithm.parse()?;
	if algorithm != Algorithm::for_key(key.size()) {
		return Err(SecretsError::Decryption(format!(
			"algorithm {algorithm} does not match {}-bit key {}",
			key.size().bits(),
			envelope.key_id
		)));
	}
	if envelope.nonce.len() != NONCE_SIZE {
		return Err(SecretsError::Decryption(format!(
			"nonce must be {NONCE_SIZE} bytes, got {}",
			envelope.nonce.len()
		)));
	}

	let payload = Payload {
		msg: envelope.ciphertext.as_slice(),
		aad: envelope.key_id.as_bytes(),
	};
	let plaintext = Zeroizing::new(match algorithm {
		Algorithm::Aes128Gcm => open::<Aes128Gcm>(key, &envelope.nonce, payload),
		Algorithm::Aes192Gcm => open::<Aes192Gcm>(key, &envelope.nonce, payload),
		Algorithm::Aes256Gcm => open::<Aes256Gcm>(key, &envelope.nonce, payload),
	}?);

	let value = std::str::from_utf8(&plaintext)
		.map_err(|_| SecretsError::Decryption("plaintext is not valid UTF-8".to_string()))?;
	Ok(SecretString::new(value.to_string()))
}

fn seal<C>(key: &KeyMaterial, nonce: &[u8], payload: Payload<'_, '_>) -> SecretsResult<Vec<u8>>
where
	C: Aead + AeadCore<NonceSize = U12> + KeyInit,
{
	let cipher = C::new_from_slice(key.expose())
		.map_err(|e| SecretsError::Encryption(format!("cipher initialization failed: {e}")))?;
	cipher
		.encrypt(GenericArray::from_slice(nonce), payload)
		.map_err(|e| SecretsError::Encryption(format!("secret encryption failed: {e}")))
}

fn open<C>(key: &KeyMaterial, nonce: &[u8], payload: Payload<'_, '_>) -> SecretsResult<Vec<u8>>
where
	C: Aead + AeadCore<NonceSize = U12> + KeyInit,
{
	let cipher = C::new_from_slice(key.expose())
		.map_err(|e| SecretsError::Decryption(format!("cipher initialization failed: {e}")))?;
	cipher
		.decrypt(GenericArray::from_slice(nonce), payload)
		.map_err(|e| SecretsError::Decryption(format!("secret decryption failed: {e}")))
}
