//! SQLite bootstrap: connection pool, migrations and seed configuration.

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::PathBuf;

use crate::providers::registry;

pub mod records;

pub use records::{RecordStore, SqliteRecords};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open (or create) the database under `workspace_dir`, apply migrations and
/// upsert the provider/profile/settings seeds.
pub fn init_db(workspace_dir: PathBuf) -> Result<DbPool> {
    std::fs::create_dir_all(&workspace_dir)?;
    let db_path = workspace_dir.join("federation.db");
    let mgr = SqliteConnectionManager::file(&db_path);
    let pool = Pool::new(mgr)?;
    {
        let conn = pool.get()?;
        apply_migrations(&conn)?;
        registry::seed_defaults(&conn)?;
    }
    Ok(pool)
}

pub fn apply_migrations(conn: &Connection) -> Result<()> {
    let migrations: &[(&str, &str)] = &[
        (
            "0001_init.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0001_init.sql"
            )),
        ),
        (
            "0002_ai_providers.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0002_ai_providers.sql"
            )),
        ),
    ];

    for (name, sql) in migrations {
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {name}"))?;
    }
    Ok(())
}

/// Pooled in-memory database with migrations and seeds applied.
///
/// The pool is capped at one connection so every checkout sees the same
/// in-memory database.
#[cfg(test)]
pub(crate) fn test_pool() -> DbPool {
    let mgr = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .build(mgr)
        .expect("in-memory pool");
    {
        let conn = pool.get().expect("checkout");
        apply_migrations(&conn).expect("migrations");
        registry::seed_defaults(&conn).expect("seeds");
    }
    pool
}
