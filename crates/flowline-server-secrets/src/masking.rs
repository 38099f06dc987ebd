// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Scrub decrypted secret values out of task output.
//!
//! Every string leaf of a JSON value (array elements and object values) has
//! each occurrence of each secret replaced with [`MASK`]. Object keys and
//! non-string scalars are left alone, so the output keeps its shape.
//!
//! Secrets are applied longest first. When one secret contains another, the
//! longer one is masked whole instead of leaving its remainder visible around
//! a masked substring.
//!
//! Masking an already masked value is a no-op as long as no secret contains
//! `*`. A secret made of or ending in `*` can match inside [`MASK`] itself, so
//! a second pass may rewrite earlier masks. Such secrets are still masked on
//! the first pass.

use std::borrow::Cow;
use std::sync::Arc;

use flowline_common_secret::SecretString;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::directory::SecretDirectory;
use crate::store::{SecretMap, SecretStore};

/// Replacement for every masked occurrence.
pub const MASK: &str = "***";

/// The set of values to mask: non-empty, de-duplicated, longest first.
#[derive(Debug, Clone, Default)]
pub struct SecretValues {
	values: Vec<SecretString>,
}

impl SecretValues {
	pub fn new<I, S>(values: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let mut values: Vec<SecretString> = values
			.into_iter()
			.map(|v| SecretString::new(v.into()))
			.filter(|v| !v.expose().is_empty())
			.collect();
		values.sort_by(|a, b| {
			b.expose()
				.len()
				.cmp(&a.expose().len())
				.then_with(|| a.expose().cmp(b.expose()))
		});
		values.dedup();
		Self { values }
	}

	pub fn from_map(secrets: &SecretMap) -> Self {
		Self::new(secrets.values().map(|v| v.expose().clone()))
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	pub fn len(&self) -> usize {
		self.values.len()
	}

	fn iter(&self) -> impl Iterator<Item = &str> {
		self.values.iter().map(|v| v.expose().as_str())
	}
}

/// Mask a single string. Borrowed when nothing matched.
pub fn mask_str<'a>(input: &'a str, secrets: &SecretValues) -> Cow<'a, str> {
	let mut masked: Option<String> = None;
	for secret in secrets.iter() {
		let current = masked.as_deref().unwrap_or(input);
		if current.contains(secret) {
			masked = Some(current.replace(secret, MASK));
		}
	}
	match masked {
		Some(m) => Cow::Owned(m),
		None => Cow::Borrowed(input),
	}
}

/// Mask every string leaf of `value`. Borrowed when nothing matched.
pub fn mask<'a>(value: &'a Value, secrets: &SecretValues) -> Cow<'a, Value> {
	if secrets.is_empty() {
		return Cow::Borrowed(value);
	}
	mask_value(value, secrets)
}

fn mask_value<'a>(value: &'a Value, secrets: &SecretValues) -> Cow<'a, Value> {
	match value {
		Value::String(s) => match mask_str(s, secrets) {
			Cow::Borrowed(_) => Cow::Borrowed(value),
			Cow::Owned(m) => Cow::Owned(Value::String(m)),
		},
		Value::Array(items) => {
			let masked: Vec<Cow<'_, Value>> =
				items.iter().map(|item| mask_value(item, secrets)).collect();
			if masked.iter().all(|m| matches!(m, Cow::Borrowed(_))) {
				return Cow::Borrowed(value);
			}
			Cow::Owned(Value::Array(
				masked.into_iter().map(Cow::into_owned).collect(),
			))
		}
		Value::Object(fields) => {
			let masked: Vec<(&String, Cow<'_, Value>)> = fields
				.iter()
				.map(|(k, v)| (k, mask_value(v, secrets)))
				.collect();
			if masked.iter().all(|(_, m)| matches!(m, Cow::Borrowed(_))) {
				return Cow::Borrowed(value);
			}
			Cow::Owned(Value::Object(
				masked
					.into_iter()
					.map(|(k, m)| (k.clone(), m.into_owned()))
					.collect::<Map<String, Value>>(),
			))
		}
		Value::Null | Value::Bool(_) | Value::Number(_) => Cow::Borrowed(value),
	}
}

/// Masks task output with the secrets visible to its workflow.
pub struct OutputMasker<S: SecretStore + 'static> {
	directory: Arc<SecretDirectory<S>>,
}

impl<S: SecretStore + 'static> OutputMasker<S> {
	pub fn new(directory: Arc<SecretDirectory<S>>) -> Self {
		Self { directory }
	}

	/// Mask `output` with the global secrets plus those of `workflow_name`.
	///
	/// Never fails. If the secrets cannot be loaded the directory logs the
	/// error and supplies none, and `output` comes back unchanged. Once a
	/// secret set is in hand the walk always runs to completion.
	#[instrument(skip(self, output))]
	pub async fn mask_output(&self, workflow_name: Option<&str>, output: Value) -> Value {
		let secrets = SecretValues::from_map(&self.directory.secrets_for_scope(workflow_name).await);
		if secrets.is_empty() {
			debug!("no secrets in scope, output unchanged");
			return output;
		}

		match mask(&output, &secrets) {
			Cow::Borrowed(_) => output,
			Cow::Owned(masked) => {
				debug!(secrets = secrets.len(), "masked secret values in output");
				masked
			}
		}
	}
}
