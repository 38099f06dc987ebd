// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{
	SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;

use crate::error::{SecretsError, SecretsResult};

const MIGRATIONS: &[(&str, &str)] = &[(
	"001_secrets",
	include_str!("../migrations/001_secrets.sql"),
)];

/// Create a SqlitePool with WAL mode and common settings.
///
/// # Arguments
/// * `database_url` - SQLite connection string (e.g., "sqlite:./flowline.db")
#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> SecretsResult<SqlitePool> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| SecretsError::Configuration(format!("invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.create_if_missing(true);

	let pool = SqlitePool::connect_with(options).await?;

	tracing::debug!("database pool created");
	Ok(pool)
}

/// Single-connection in-memory pool; every connection to `:memory:` is a
/// separate database, so the pool must never open a second one.
pub async fn create_memory_pool() -> SecretsResult<SqlitePool> {
	let options = SqliteConnectOptions::from_str("sqlite::memory:")
		.map_err(|e| SecretsError::Configuration(format!("invalid database URL: {e}")))?;

	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect_with(options)
		.await?;
	Ok(pool)
}

/// Apply the embedded schema. Idempotent.
#[tracing::instrument(skip(pool))]
pub async fn migrate(pool: &SqlitePool) -> SecretsResult<()> {
	for (name, sql) in MIGRATIONS {
		for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
			sqlx::query(stmt).execute(pool).await?;
		}
		tracing::debug!(migration = name, "migration applied");
	}
	Ok(())
}
