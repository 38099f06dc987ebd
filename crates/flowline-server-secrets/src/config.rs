// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration for the secrets subsystem.
//!
//! Layers are merged in precedence order (defaults < TOML file < environment)
//! and then finalized into a validated [`SecretsConfig`]:
//!
//! ```toml
//! [encryption]
//! enabled = true
//! active_key_id = "k2"
//!
//! [encryption.keys]
//! k1 = "<base64>"
//! k2 = "<base64>"
//!
//! [cache]
//! ttl_secs = 60
//! max_entries = 100
//! ```
//!
//! Environment variables:
//! - `FLOWLINE_SECRETS_ENCRYPTION_ENABLED`
//! - `FLOWLINE_SECRETS_ACTIVE_KEY_ID`
//! - `FLOWLINE_SECRETS_KEYS` (`id=base64,id=base64`) or `FLOWLINE_SECRETS_KEYS_FILE`
//! - `FLOWLINE_SECRETS_CACHE_TTL_SECS`
//! - `FLOWLINE_SECRETS_CACHE_MAX_ENTRIES`

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use flowline_common_secret::SecretString;
use serde::Deserialize;
use tracing::{debug, info, trace};

use crate::error::{SecretsError, SecretsResult};

/// Default cache expire-after-write window.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;

/// Default maximum number of cached scopes.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 100;

const ENV_PREFIX: &str = "FLOWLINE_SECRETS";

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Validated secrets configuration.
#[derive(Debug, Clone, Default)]
pub struct SecretsConfig {
	pub encryption: EncryptionConfig,
	pub cache: CacheConfig,
}

/// Key material settings. Key values stay base64 until a key ring is built.
#[derive(Debug, Clone, Default)]
pub struct EncryptionConfig {
	pub enabled: bool,
	pub active_key_id: Option<String>,
	pub keys: BTreeMap<String, SecretString>,
}

/// Cache bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
	pub ttl: Duration,
	pub max_entries: NonZeroUsize,
}

impl CacheConfig {
	pub fn new(ttl: Duration, max_entries: usize) -> SecretsResult<Self> {
		if ttl.is_zero() {
			return Err(SecretsError::Configuration(
				"cache ttl must be greater than zero".to_string(),
			));
		}
		let max_entries = NonZeroUsize::new(max_entries).ok_or_else(|| {
			SecretsError::Configuration("cache max_entries must be greater than zero".to_string())
		})?;
		Ok(Self { ttl, max_entries })
	}
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
			max_entries: NonZeroUsize::new(DEFAULT_CACHE_MAX_ENTRIES)
				.unwrap_or(NonZeroUsize::MIN),
		}
	}
}

// =============================================================================
// Layers
// =============================================================================

/// Secrets configuration layer - all fields are Option for merging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretsConfigLayer {
	#[serde(default)]
	pub encryption: Option<EncryptionConfigLayer>,
	#[serde(default)]
	pub cache: Option<CacheConfigLayer>,
}

impl SecretsConfigLayer {
	/// Merge another layer into this one. Other layer takes precedence.
	pub fn merge(&mut self, other: SecretsConfigLayer) {
		merge_option(
			&mut self.encryption,
			other.encryption,
			EncryptionConfigLayer::merge,
		);
		merge_option(&mut self.cache, other.cache, CacheConfigLayer::merge);
	}

	pub fn finalize(self) -> SecretsResult<SecretsConfig> {
		Ok(SecretsConfig {
			encryption: self.encryption.unwrap_or_default().finalize(),
			cache: self.cache.unwrap_or_default().finalize()?,
		})
	}
}

/// Encryption layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncryptionConfigLayer {
	pub enabled: Option<bool>,
	pub active_key_id: Option<String>,
	/// Replaced wholesale on merge; key sets from different sources never mix.
	pub keys: Option<BTreeMap<String, SecretString>>,
}

impl EncryptionConfigLayer {
	pub fn merge(&mut self, other: EncryptionConfigLayer) {
		if other.enabled.is_some() {
			self.enabled = other.enabled;
		}
		if other.active_key_id.is_some() {
			self.active_key_id = other.active_key_id;
		}
		if other.keys.is_some() {
			self.keys = other.keys;
		}
	}

	pub fn finalize(self) -> EncryptionConfig {
		EncryptionConfig {
			enabled: self.enabled.unwrap_or(false),
			active_key_id: self.active_key_id,
			keys: self.keys.unwrap_or_default(),
		}
	}
}

/// Cache layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfigLayer {
	pub ttl_secs: Option<u64>,
	pub max_entries: Option<usize>,
}

impl CacheConfigLayer {
	pub fn merge(&mut self, other: CacheConfigLayer) {
		if other.ttl_secs.is_some() {
			self.ttl_secs = other.ttl_secs;
		}
		if other.max_entries.is_some() {
			self.max_entries = other.max_entries;
		}
	}

	pub fn finalize(self) -> SecretsResult<CacheConfig> {
		CacheConfig::new(
			Duration::from_secs(self.ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS)),
			self.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
		)
	}
}

fn merge_option<T, F>(target: &mut Option<T>, source: Option<T>, merge_fn: F)
where
	F: FnOnce(&mut T, T),
{
	match (target.as_mut(), source) {
		(Some(t), Some(s)) => merge_fn(t, s),
		(None, Some(s)) => *target = Some(s),
		_ => {}
	}
}

// =============================================================================
// Sources
// =============================================================================

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

/// A place configuration layers come from.
pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> SecretsResult<SecretsConfigLayer>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> SecretsResult<SecretsConfigLayer> {
		debug!("loading defaults");
		Ok(SecretsConfigLayer::default())
	}
}

/// TOML file source. A missing file contributes nothing.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new("/etc/flowline/secrets.toml")
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> SecretsResult<SecretsConfigLayer> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(SecretsConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| {
			SecretsError::Configuration(format!(
				"failed to read config file {}: {e}",
				self.path.display()
			))
		})?;

		let layer: SecretsConfigLayer = toml::from_str(&content).map_err(|e| {
			SecretsError::Configuration(format!(
				"failed to parse TOML config at {}: {e}",
				self.path.display()
			))
		})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: `<PREFIX>_<FIELD>`, prefix defaults to `FLOWLINE_SECRETS`.
pub struct EnvSource {
	prefix: String,
}

impl EnvSource {
	pub fn with_prefix(prefix: impl Into<String>) -> Self {
		Self {
			prefix: prefix.into(),
		}
	}

	fn var(&self, field: &str) -> String {
		format!("{}_{field}", self.prefix)
	}
}

impl Default for EnvSource {
	fn default() -> Self {
		Self::with_prefix(ENV_PREFIX)
	}
}

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> SecretsResult<SecretsConfigLayer> {
		debug!(prefix = %self.prefix, "loading environment variables");

		let keys_var = self.var("KEYS");
		let keys = load_secret_env(&keys_var)?
			.map(|list| parse_key_list(&keys_var, &list))
			.transpose()?;

		Ok(SecretsConfigLayer {
			encryption: Some(EncryptionConfigLayer {
				enabled: env_bool(&self.var("ENCRYPTION_ENABLED")),
				active_key_id: env_var(&self.var("ACTIVE_KEY_ID")),
				keys,
			}),
			cache: Some(CacheConfigLayer {
				ttl_secs: env_u64(&self.var("CACHE_TTL_SECS"))?,
				max_entries: env_usize(&self.var("CACHE_MAX_ENTRIES"))?,
			}),
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_u64(name: &str) -> SecretsResult<Option<u64>> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| {
			SecretsError::Configuration(format!("invalid value for {name}: '{v}' is not a u64"))
		}),
		None => Ok(None),
	}
}

fn env_usize(name: &str) -> SecretsResult<Option<usize>> {
	env_u64(name)?
		.map(|v| {
			usize::try_from(v).map_err(|_| {
				SecretsError::Configuration(format!(
					"invalid value for {name}: {v} does not fit in usize"
				))
			})
		})
		.transpose()
}

/// Load a secret from `VAR_FILE` if set, otherwise from `VAR`.
fn load_secret_env(var: &str) -> SecretsResult<Option<SecretString>> {
	let file_var = format!("{var}_FILE");

	if let Ok(path_str) = std::env::var(&file_var) {
		if path_str.is_empty() {
			return Err(SecretsError::Configuration(format!(
				"secret file path in {file_var} is empty"
			)));
		}
		let content = std::fs::read_to_string(&path_str).map_err(|e| {
			SecretsError::Configuration(format!("failed to read {file_var} from {path_str}: {e}"))
		})?;
		let secret = content.strip_suffix('\n').unwrap_or(&content).to_string();
		return Ok(Some(SecretString::new(secret)));
	}

	Ok(env_var(var).map(SecretString::new))
}

/// Parse `id=base64,id=base64`. Whitespace and newlines around entries are ignored.
fn parse_key_list(
	var: &str,
	list: &SecretString,
) -> SecretsResult<BTreeMap<String, SecretString>> {
	let mut keys = BTreeMap::new();
	for entry in list
		.expose()
		.split([',', '\n'])
		.map(str::trim)
		.filter(|e| !e.is_empty())
	{
		let (id, value) = entry.split_once('=').ok_or_else(|| {
			SecretsError::Configuration(format!("{var}: entries must look like id=base64"))
		})?;
		let id = id.trim();
		if id.is_empty() {
			return Err(SecretsError::Configuration(format!(
				"{var}: key id must not be empty"
			)));
		}
		if keys
			.insert(id.to_string(), SecretString::new(value.trim().to_string()))
			.is_some()
		{
			return Err(SecretsError::Configuration(format!(
				"{var}: duplicate key id {id}"
			)));
		}
	}
	Ok(keys)
}

// =============================================================================
// Loading
// =============================================================================

/// Load configuration from all sources with standard precedence.
///
/// Precedence (highest to lowest):
/// 1. Environment variables (`FLOWLINE_SECRETS_*`)
/// 2. Config file (`/etc/flowline/secrets.toml`)
/// 3. Built-in defaults
pub fn load_config() -> SecretsResult<SecretsConfig> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::system()),
		Box::new(EnvSource::default()),
	])
}

/// Load configuration with a custom config file path.
pub fn load_config_with_file(config_path: impl Into<PathBuf>) -> SecretsResult<SecretsConfig> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::new(config_path)),
		Box::new(EnvSource::default()),
	])
}

pub fn load_from_sources(
	mut sources: Vec<Box<dyn ConfigSource>>,
) -> SecretsResult<SecretsConfig> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = SecretsConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		merged.merge(source.load()?);
	}

	let config = merged.finalize()?;
	info!(
		encryption_enabled = config.encryption.enabled,
		active_key_id = config.encryption.active_key_id.as_deref().unwrap_or(""),
		key_count = config.encryption.keys.len(),
		cache_ttl_secs = config.cache.ttl.as_secs(),
		cache_max_entries = config.cache.max_entries.get(),
		"secrets configuration loaded"
	);
	Ok(config)
}
