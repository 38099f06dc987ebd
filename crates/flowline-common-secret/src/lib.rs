// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wrapper for values that must never show up in logs, dumps or task output.
//!
//! [`Secret<T>`] is used for decrypted secret values and for raw key bytes.
//! Formatting and serialization always produce [`REDACTED`], the inner value
//! is zeroized when the wrapper is dropped, and reading it requires an
//! explicit [`Secret::expose`] call.
//!
//! ```
//! use flowline_common_secret::SecretString;
//!
//! let token = SecretString::from("ghp_live_token");
//! assert_eq!(format!("{token}"), "[REDACTED]");
//! assert_eq!(format!("{token:?}"), "Secret(\"[REDACTED]\")");
//! assert_eq!(token.expose(), "ghp_live_token");
//! ```

use std::fmt;

use zeroize::Zeroize;

/// Placeholder rendered instead of a secret value.
pub const REDACTED: &str = "[REDACTED]";

/// A sensitive value. See the crate docs.
pub struct Secret<T: Zeroize> {
	inner: T,
}

/// Decrypted secret value.
pub type SecretString = Secret<String>;

/// Raw key material.
pub type SecretBytes = Secret<Vec<u8>>;

impl<T: Zeroize> Secret<T> {
	pub fn new(inner: T) -> Self {
		Self { inner }
	}

	/// Borrow the inner value. Every call site is a place where the secret
	/// leaves the wrapper, so keep them few and obvious.
	pub fn expose(&self) -> &T {
		&self.inner
	}

	/// Move the inner value out, leaving a zeroized default behind.
	pub fn into_inner(mut self) -> T
	where
		T: Default,
	{
		std::mem::take(&mut self.inner)
	}
}

impl<T: Zeroize> Drop for Secret<T> {
	fn drop(&mut self) {
		self.inner.zeroize();
	}
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
	fn clone(&self) -> Self {
		Self::new(self.inner.clone())
	}
}

impl<T: Zeroize + PartialEq> PartialEq for Secret<T> {
	fn eq(&self, other: &Self) -> bool {
		self.inner == other.inner
	}
}

impl<T: Zeroize + Eq> Eq for Secret<T> {}

impl<T: Zeroize> fmt::Debug for Secret<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("Secret").field(&REDACTED).finish()
	}
}

impl<T: Zeroize> fmt::Display for Secret<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

impl From<String> for SecretString {
	fn from(value: String) -> Self {
		Self::new(value)
	}
}

impl From<&str> for SecretString {
	fn from(value: &str) -> Self {
		Self::new(value.to_string())
	}
}

impl From<Vec<u8>> for SecretBytes {
	fn from(value: Vec<u8>) -> Self {
		Self::new(value)
	}
}

#[cfg(feature = "serde")]
mod serde_impl {
	use serde::{Deserialize, Deserializer, Serialize, Serializer};
	use zeroize::Zeroize;

	use super::{Secret, REDACTED};

	// Serializing never writes the value; config dumps and API payloads get the placeholder.
	impl<T: Zeroize> Serialize for Secret<T> {
		fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
			serializer.serialize_str(REDACTED)
		}
	}

	impl<'de, T: Zeroize + Deserialize<'de>> Deserialize<'de> for Secret<T> {
		fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
			T::deserialize(deserializer).map(Secret::new)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn formatting_is_redacted() {
		let value = SecretString::from("db-password-123");
		assert_eq!(format!("{value}"), REDACTED);
		assert!(!format!("{value:?}").contains("db-password-123"));
		assert!(!format!("{:?}", Some(value)).contains("db-password-123"));
	}

	#[test]
	fn key_bytes_are_redacted() {
		let key = SecretBytes::from(vec![0xAB; 32]);
		let debug = format!("{key:?}");
		assert!(debug.contains(REDACTED));
		assert!(!debug.contains("171"));
	}

	#[test]
	fn into_inner_moves_value_out() {
		let value = SecretString::from("abc");
		assert_eq!(value.into_inner(), "abc");
	}

	#[test]
	fn equality_uses_inner_value() {
		assert_eq!(SecretString::from("a"), SecretString::from("a"));
		assert_ne!(SecretString::from("a"), SecretString::from("b"));
	}

	#[cfg(feature = "serde")]
	#[test]
	fn serializes_placeholder_and_deserializes_value() {
		let json = serde_json::to_string(&SecretString::from("hunter2")).unwrap();
		assert_eq!(json, format!("\"{REDACTED}\""));

		let parsed: SecretString = serde_json::from_str("\"hunter2\"").unwrap();
		assert_eq!(parsed.expose(), "hunter2");
	}

	proptest! {
		#[test]
		fn display_never_contains_value(inner in "[a-zA-Z0-9_-]{4,40}") {
			prop_assume!(!"Secret(\"[REDACTED]\")".contains(&inner));
			let secret = SecretString::new(inner.clone());
			let shown = format!("{}", secret);
			let debugged = format!("{:?}", secret);
			prop_assert!(!shown.contains(&inner));
			prop_assert!(!debugged.contains(&inner));
		}
	}
}
