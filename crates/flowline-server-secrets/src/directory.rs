// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Secret directory: the service facade over a store and its cache.
//!
//! Writes and single-secret reads go straight to the store. Bulk reads used
//! for masking go through the cache, one entry per scope, and the workflow
//! scope is overlaid on the global scope after both are loaded.
//!
//! # Consistency
//!
//! Every successful `put` or `delete` clears the whole cache before it
//! returns, so the next bulk read of any scope sees the write.
//!
//! # Degraded reads
//!
//! Bulk reads never fail. A load failure is logged and the whole result is
//! empty, even when only one of the two scopes failed, so callers never act
//! on a partial secret set.

use std::sync::Arc;

use flowline_common_secret::SecretString;
use tracing::{debug, error, info, instrument};

use crate::cache::{LoadResult, SecretCache};
use crate::config::CacheConfig;
use crate::error::{SecretsError, SecretsResult};
use crate::store::{SecretMap, SecretStore};
use crate::types::SecretScope;

pub struct SecretDirectory<S: SecretStore + 'static> {
	store: Arc<S>,
	cache: SecretCache,
}

impl<S: SecretStore + 'static> SecretDirectory<S> {
	pub fn new(store: Arc<S>, cache_config: CacheConfig) -> Self {
		Self {
			store,
			cache: SecretCache::new(cache_config),
		}
	}

	pub fn store(&self) -> &Arc<S> {
		&self.store
	}

	pub fn cache(&self) -> &SecretCache {
		&self.cache
	}

	#[instrument(skip(self, value, description), fields(name = %name, scope = %scope))]
	pub async fn put(
		&self,
		name: &str,
		value: &SecretString,
		created_by: &str,
		description: &str,
		scope: &SecretScope,
	) -> SecretsResult<()> {
		self
			.store
			.put(name, value, created_by, description, scope)
			.await?;
		self.cache.invalidate_all();
		info!("secret saved");
		Ok(())
	}

	#[instrument(skip(self), fields(name = %name, scope = %scope))]
	pub async fn delete(&self, name: &str, scope: &SecretScope) -> SecretsResult<()> {
		self.store.delete(name, scope).await?;
		self.cache.invalidate_all();
		info!("secret removed");
		Ok(())
	}

	pub async fn get(&self, name: &str, scope: &SecretScope) -> SecretsResult<Option<SecretString>> {
		self.store.get(name, scope).await
	}

	pub async fn exists(&self, name: &str, scope: &SecretScope) -> SecretsResult<bool> {
		self.store.exists(name, scope).await
	}

	pub async fn list_names(&self, scope: &SecretScope) -> SecretsResult<Vec<String>> {
		self.store.list_names(scope).await
	}

	/// All global secrets; empty if they cannot be loaded.
	pub async fn global_secrets(&self) -> Arc<SecretMap> {
		let scope = SecretScope::Global;
		self.load_scope(&scope)
			.await
			.unwrap_or_else(|e| Arc::new(degraded(&scope, &e)))
	}

	/// Global secrets overlaid with the workflow's own; the workflow wins on
	/// a name collision. `None` yields the global secrets alone.
	///
	/// If either scope fails to load the result is empty, never a partial view.
	#[instrument(skip(self))]
	pub async fn secrets_for_scope(&self, workflow_name: Option<&str>) -> SecretMap {
		let scope = SecretScope::from_workflow(workflow_name);
		let global = match self.load_scope(&SecretScope::Global).await {
			Ok(global) => global,
			Err(e) => return degraded(&SecretScope::Global, &e),
		};
		if scope.is_global() {
			return global.as_ref().clone();
		}

		let scoped = match self.load_scope(&scope).await {
			Ok(scoped) => scoped,
			Err(e) => return degraded(&scope, &e),
		};
		let mut merged = global.as_ref().clone();
		merged.extend(scoped.iter().map(|(k, v)| (k.clone(), v.clone())));
		debug!(
			global = global.len(),
			scoped = scoped.len(),
			merged = merged.len(),
			"merged secret scopes"
		);
		merged
	}

	async fn load_scope(&self, scope: &SecretScope) -> LoadResult {
		let store = Arc::clone(&self.store);
		let owned = scope.clone();
		self.cache
			.get_or_load(scope, move || async move { store.get_all(&owned).await })
			.await
	}
}

fn degraded(scope: &SecretScope, e: &SecretsError) -> SecretMap {
	error!(scope = %scope, error = %e, "failed to load secrets, continuing without them");
	SecretMap::new()
}
