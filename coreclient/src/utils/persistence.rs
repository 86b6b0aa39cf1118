// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{path::Path, time::Duration};

use sqlx::{
    SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Opens (or creates) the client database at the given path and runs all pending migrations.
pub async fn open_db(path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let path = path.as_ref();
    info!(path = %path.display(), "opening client database");
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

/// Opens an ephemeral database which lives as long as the returned pool.
///
/// The pool is limited to a single connection which is never recycled: every connection to
/// `:memory:` would otherwise see its own empty database.
pub async fn open_db_in_memory() -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::new().in_memory(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}
