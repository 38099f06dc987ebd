// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Read-through cache of decrypted secrets, one entry per scope.
//!
//! - Entries expire a fixed time after they were written and are evicted
//!   least-recently-used beyond `max_entries`.
//! - Concurrent misses on the same scope share one load; misses on different
//!   scopes never wait on each other.
//! - [`SecretCache::invalidate_all`] drops every entry and every in-flight
//!   registration. A load that started before the invalidation still answers
//!   its callers but is never stored.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::error::{SecretsError, SecretsResult};
use crate::store::SecretMap;
use crate::types::SecretScope;

/// Outcome of a scope load, shared between every caller waiting on it.
pub type LoadResult = Result<Arc<SecretMap>, Arc<SecretsError>>;

type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

struct Entry {
	secrets: Arc<SecretMap>,
	written_at: Instant,
}

struct InFlight {
	id: u64,
	generation: u64,
	load: SharedLoad,
}

struct State {
	entries: LruCache<SecretScope, Entry>,
	in_flight: HashMap<SecretScope, InFlight>,
	generation: u64,
	next_load_id: u64,
}

pub struct SecretCache {
	config: CacheConfig,
	state: Mutex<State>,
}

impl SecretCache {
	pub fn new(config: CacheConfig) -> Self {
		Self {
			state: Mutex::new(State {
				entries: LruCache::new(config.max_entries),
				in_flight: HashMap::new(),
				generation: 0,
				next_load_id: 0,
			}),
			config,
		}
	}

	pub fn config(&self) -> &CacheConfig {
		&self.config
	}

	/// Return the cached secrets for `scope`, loading them with `loader` on a
	/// miss. `loader` is only invoked when no load for the scope is running.
	pub async fn get_or_load<F, Fut>(&self, scope: &SecretScope, loader: F) -> LoadResult
	where
		F: FnOnce() -> Fut + Send,
		Fut: Future<Output = SecretsResult<SecretMap>> + Send + 'static,
	{
		let (load, id, generation) = {
			let mut state = self.state.lock();

			let ttl = self.config.ttl;
			let fresh = state
				.entries
				.get(scope)
				.filter(|entry| entry.written_at.elapsed() < ttl)
				.map(|entry| Arc::clone(&entry.secrets));
			if let Some(secrets) = fresh {
				trace!(scope = %scope, "secret cache hit");
				return Ok(secrets);
			}
			if state.entries.pop(scope).is_some() {
				debug!(scope = %scope, "secret cache entry expired");
			}

			match state.in_flight.get(scope) {
				Some(flight) => {
					trace!(scope = %scope, "joining in-flight secret load");
					(flight.load.clone(), flight.id, flight.generation)
				}
				None => {
					let id = state.next_load_id;
					state.next_load_id += 1;
					let generation = state.generation;
					let load = loader()
						.map(|result| result.map(Arc::new).map_err(Arc::new))
						.boxed()
						.shared();
					state.in_flight.insert(
						scope.clone(),
						InFlight {
							id,
							generation,
							load: load.clone(),
						},
					);
					debug!(scope = %scope, "secret cache miss, loading");
					(load, id, generation)
				}
			}
		};

		let result = load.await;

		let mut state = self.state.lock();
		if state.in_flight.get(scope).is_some_and(|flight| flight.id == id) {
			state.in_flight.remove(scope);
			if let Ok(secrets) = &result {
				if state.generation == generation {
					state.entries.put(
						scope.clone(),
						Entry {
							secrets: Arc::clone(secrets),
							written_at: Instant::now(),
						},
					);
				}
			}
		}
		result
	}

	/// Drop every entry and in-flight registration.
	pub fn invalidate_all(&self) {
		let mut state = self.state.lock();
		state.entries.clear();
		state.in_flight.clear();
		state.generation += 1;
		debug!(generation = state.generation, "secret cache invalidated");
	}

	/// Number of stored entries, expired ones included until next touched.
	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl std::fmt::Debug for SecretCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.state.lock();
		f.debug_struct("SecretCache")
			.field("config", &self.config)
			.field("entries", &state.entries.len())
			.field("in_flight", &state.in_flight.len())
			.field("generation", &state.generation)
			.finish()
	}
}
