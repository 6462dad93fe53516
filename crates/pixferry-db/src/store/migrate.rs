//! Additive schema migration.
//!
//! On open, the current schema is inspected and brought up to date by
//! creating missing tables, adding missing columns with safe defaults, and
//! creating missing indexes. Nothing is ever dropped or retyped; an existing
//! column whose declared type conflicts with the expected one is an
//! irreconcilable [`PipelineError::Schema`] conflict.

use sqlx::{Row, SqlitePool};

use pixferry_core::{PipelineError, PipelineResult};

struct ColumnSpec {
    name: &'static str,
    /// Declared SQLite type, uppercase.
    decl_type: &'static str,
    /// Clause appended after the type in ALTER TABLE ADD COLUMN.
    add_clause: &'static str,
}

struct TableSpec {
    name: &'static str,
    create_sql: &'static str,
    columns: &'static [ColumnSpec],
}

const MEDIA_FILES: TableSpec = TableSpec {
    name: "media_files",
    create_sql: "CREATE TABLE media_files (
        id TEXT PRIMARY KEY,
        filename TEXT NOT NULL,
        path TEXT NOT NULL,
        source_path TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        hash TEXT,
        compression_ratio REAL,
        is_duplicate INTEGER NOT NULL DEFAULT 0,
        source_kind TEXT NOT NULL,
        status TEXT NOT NULL,
        batch_id TEXT,
        created_at TEXT NOT NULL,
        processed_at TEXT,
        updated_at TEXT NOT NULL,
        mirror_synced INTEGER NOT NULL DEFAULT 0,
        UNIQUE (source_path, filename)
    )",
    columns: &[
        ColumnSpec { name: "id", decl_type: "TEXT", add_clause: "" },
        ColumnSpec { name: "filename", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "path", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "source_path", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "size_bytes", decl_type: "INTEGER", add_clause: "NOT NULL DEFAULT 0" },
        ColumnSpec { name: "hash", decl_type: "TEXT", add_clause: "" },
        ColumnSpec { name: "compression_ratio", decl_type: "REAL", add_clause: "" },
        ColumnSpec { name: "is_duplicate", decl_type: "INTEGER", add_clause: "NOT NULL DEFAULT 0" },
        ColumnSpec { name: "source_kind", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT 'folder'" },
        ColumnSpec { name: "status", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT 'downloaded'" },
        ColumnSpec { name: "batch_id", decl_type: "TEXT", add_clause: "" },
        ColumnSpec { name: "created_at", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "processed_at", decl_type: "TEXT", add_clause: "" },
        ColumnSpec { name: "updated_at", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "mirror_synced", decl_type: "INTEGER", add_clause: "NOT NULL DEFAULT 0" },
    ],
};

const BATCHES: TableSpec = TableSpec {
    name: "batches",
    create_sql: "CREATE TABLE batches (
        id TEXT PRIMARY KEY,
        destination TEXT NOT NULL,
        status TEXT NOT NULL,
        total_size_bytes INTEGER NOT NULL DEFAULT 0,
        file_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        mirror_synced INTEGER NOT NULL DEFAULT 0
    )",
    columns: &[
        ColumnSpec { name: "id", decl_type: "TEXT", add_clause: "" },
        ColumnSpec { name: "destination", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT 'icloud'" },
        ColumnSpec { name: "status", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT 'created'" },
        ColumnSpec { name: "total_size_bytes", decl_type: "INTEGER", add_clause: "NOT NULL DEFAULT 0" },
        ColumnSpec { name: "file_count", decl_type: "INTEGER", add_clause: "NOT NULL DEFAULT 0" },
        ColumnSpec { name: "created_at", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "completed_at", decl_type: "TEXT", add_clause: "" },
        ColumnSpec { name: "mirror_synced", decl_type: "INTEGER", add_clause: "NOT NULL DEFAULT 0" },
    ],
};

const DUPLICATES: TableSpec = TableSpec {
    name: "duplicates",
    create_sql: "CREATE TABLE duplicates (
        id TEXT PRIMARY KEY,
        original_id TEXT NOT NULL,
        duplicate_id TEXT NOT NULL UNIQUE,
        hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    columns: &[
        ColumnSpec { name: "id", decl_type: "TEXT", add_clause: "" },
        ColumnSpec { name: "original_id", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "duplicate_id", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "hash", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "created_at", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
    ],
};

const LOG_ENTRIES: TableSpec = TableSpec {
    name: "log_entries",
    create_sql: "CREATE TABLE log_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        step TEXT NOT NULL,
        message TEXT NOT NULL,
        severity TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    columns: &[
        ColumnSpec { name: "id", decl_type: "INTEGER", add_clause: "" },
        ColumnSpec { name: "step", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "message", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
        ColumnSpec { name: "severity", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT 'info'" },
        ColumnSpec { name: "created_at", decl_type: "TEXT", add_clause: "NOT NULL DEFAULT ''" },
    ],
};

const TABLES: [&TableSpec; 4] = [&MEDIA_FILES, &BATCHES, &DUPLICATES, &LOG_ENTRIES];

const INDEXES: &[(&str, &str)] = &[
    (
        "idx_media_files_hash",
        "CREATE INDEX IF NOT EXISTS idx_media_files_hash ON media_files (hash)",
    ),
    (
        "idx_media_files_status",
        "CREATE INDEX IF NOT EXISTS idx_media_files_status ON media_files (status)",
    ),
    (
        "idx_media_files_batch_id",
        "CREATE INDEX IF NOT EXISTS idx_media_files_batch_id ON media_files (batch_id)",
    ),
    (
        "idx_log_entries_step_severity",
        "CREATE INDEX IF NOT EXISTS idx_log_entries_step_severity ON log_entries (step, severity)",
    ),
];

/// Bring the schema up to date. Safe to run on every open.
pub(crate) async fn run(pool: &SqlitePool) -> PipelineResult<()> {
    for table in TABLES {
        if table_exists(pool, table.name).await? {
            reconcile_columns(pool, table).await?;
        } else {
            sqlx::query(table.create_sql).execute(pool).await?;
            tracing::debug!(table = table.name, "created table");
        }
    }
    for (name, sql) in INDEXES {
        sqlx::query(sql).execute(pool).await?;
        tracing::trace!(index = name, "ensured index");
    }
    Ok(())
}

async fn table_exists(pool: &SqlitePool, name: &str) -> PipelineResult<bool> {
    let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

async fn reconcile_columns(pool: &SqlitePool, table: &TableSpec) -> PipelineResult<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table.name))
        .fetch_all(pool)
        .await?;

    let mut existing = Vec::with_capacity(rows.len());
    for row in &rows {
        let name: String = row.try_get("name")?;
        let decl_type: String = row.try_get("type")?;
        existing.push((name, decl_type.to_uppercase()));
    }

    for spec in table.columns {
        match existing.iter().find(|(name, _)| name == spec.name) {
            Some((_, decl_type)) => {
                if decl_type != spec.decl_type {
                    return Err(PipelineError::Schema(format!(
                        "{}.{} has type {} but {} is required",
                        table.name, spec.name, decl_type, spec.decl_type
                    )));
                }
            }
            None => {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} {} {}",
                    table.name, spec.name, spec.decl_type, spec.add_clause
                );
                sqlx::query(sql.trim()).execute(pool).await?;
                tracing::info!(
                    table = table.name,
                    column = spec.name,
                    "added missing column"
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrates_older_schema_by_adding_columns() {
        let pool = memory_pool().await;
        // An older deployment without the mirror_synced column.
        sqlx::query(
            "CREATE TABLE media_files (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                path TEXT NOT NULL,
                source_path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                hash TEXT,
                compression_ratio REAL,
                is_duplicate INTEGER NOT NULL DEFAULT 0,
                source_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                batch_id TEXT,
                created_at TEXT NOT NULL,
                processed_at TEXT,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();

        run(&pool).await.unwrap();

        let rows = sqlx::query("PRAGMA table_info(media_files)")
            .fetch_all(&pool)
            .await
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();
        assert!(names.contains(&"mirror_synced".to_string()));
    }

    #[tokio::test]
    async fn test_incompatible_column_type_is_schema_error() {
        let pool = memory_pool().await;
        sqlx::query("CREATE TABLE batches (id TEXT PRIMARY KEY, destination INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();

        let err = run(&pool).await.unwrap_err();
        assert_eq!(err.kind(), "schema");
        assert!(err.to_string().contains("batches.destination"));
    }

    #[tokio::test]
    async fn test_fresh_database_gets_all_tables_and_indexes() {
        let pool = memory_pool().await;
        run(&pool).await.unwrap();

        for table in ["media_files", "batches", "duplicates", "log_entries"] {
            assert!(table_exists(&pool, table).await.unwrap(), "{}", table);
        }
        let indexes =
            sqlx::query("SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(indexes.len(), 4);
    }
}
