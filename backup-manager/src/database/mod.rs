//! Database dump phase.
//!
//! Runs the dump utility into the run's `database/` directory, optionally
//! compresses the result block by block, checksums the final artifact and
//! attaches per-table row counts when the schema can be queried.

pub mod schema;

use crate::archive::compression::{calculate_checksum, compress_file, Compression};
use crate::config::DatabaseConfig;
use crate::executor::manifest::DatabaseArtifact;
use crate::process::{CommandRunner, CommandSpec};
use crate::transfer::progress::format_bytes;
use crate::utils::errors::{BackupError, IoResultExt, Result};
use schema::SchemaInspector;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Compression settings for the dump artifact.
#[derive(Debug, Clone, Copy)]
pub struct DumpCompression {
    pub codec: Compression,
    pub level: i32,
    pub chunk_size: usize,
}

pub struct DatabaseArchiver {
    runner: Arc<dyn CommandRunner>,
    inspector: Arc<dyn SchemaInspector>,
    db: DatabaseConfig,
    compression: DumpCompression,
}

impl DatabaseArchiver {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        inspector: Arc<dyn SchemaInspector>,
        db: DatabaseConfig,
        compression: DumpCompression,
    ) -> Self {
        Self {
            runner,
            inspector,
            db,
            compression,
        }
    }

    pub fn dump_file_name(&self) -> String {
        format!("{}.sql", self.db.name)
    }

    /// Dump utility invocation writing to `output`.
    pub fn dump_command(&self, output: &Path) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.db.dump_command)
            .arg(format!("--host={}", self.db.host))
            .arg(format!("--port={}", self.db.port))
            .arg(format!("--user={}", self.db.user))
            .arg("--single-transaction")
            .arg("--quick")
            .arg("--routines")
            .arg("--triggers")
            .arg("--events")
            .arg(format!("--default-character-set={}", self.db.charset))
            .arg(format!("--result-file={}", output.display()))
            .arg(&self.db.name);
        if !self.db.password.is_empty() {
            cmd = cmd.env("MYSQL_PWD", &self.db.password);
        }
        cmd
    }

    /// Produce the dump artifact inside `out_dir`.
    pub async fn archive(&self, out_dir: &Path) -> Result<DatabaseArtifact> {
        let dump_path = out_dir.join(self.dump_file_name());
        info!(database = %self.db.name, host = %self.db.host, "Dumping database");

        let output = self.runner.run(&self.dump_command(&dump_path)).await?;
        if !output.success() {
            // A failed dump may leave a truncated file behind.
            let _ = std::fs::remove_file(&dump_path);
        }
        output.check(&self.db.dump_command)?;

        let dump_size = match std::fs::metadata(&dump_path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(BackupError::Integrity(format!(
                    "dump file {} was not created",
                    dump_path.display()
                )))
            }
        };
        if dump_size == 0 {
            return Err(BackupError::Integrity(format!(
                "dump file {} is empty",
                dump_path.display()
            )));
        }
        info!("Dump written: {} ({})", dump_path.display(), format_bytes(dump_size));

        let (artifact_path, original_size, compression_ratio) =
            self.compress(dump_path, dump_size).await?;

        let checksum = {
            let path = artifact_path.clone();
            tokio::task::spawn_blocking(move || calculate_checksum(&path)).await??
        };
        let size = std::fs::metadata(&artifact_path).at(&artifact_path)?.len();

        let tables = match self.inspector.table_stats().await {
            Ok(tables) => tables,
            Err(e) => {
                warn!("Could not collect table statistics: {}", e);
                Vec::new()
            }
        };
        let rows: u64 = tables.iter().map(|t| t.rows).sum();

        Ok(DatabaseArtifact {
            file: artifact_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size,
            checksum,
            tables,
            rows,
            compressed: self.compression.codec.is_enabled(),
            original_size,
            compression_ratio,
        })
    }

    async fn compress(&self, dump_path: PathBuf, dump_size: u64) -> Result<(PathBuf, Option<u64>, Option<f64>)> {
        let settings = self.compression;
        if !settings.codec.is_enabled() {
            return Ok((dump_path, None, None));
        }

        let packed = settings.codec.compressed_path(&dump_path);
        let stats = {
            let (src, dest) = (dump_path.clone(), packed.clone());
            tokio::task::spawn_blocking(move || {
                compress_file(&src, &dest, settings.codec, settings.level, settings.chunk_size)
            })
            .await?
        };
        let stats = match stats {
            Ok(stats) => stats,
            Err(e) => {
                let _ = std::fs::remove_file(&packed);
                return Err(e);
            }
        };

        std::fs::remove_file(&dump_path).at(&dump_path)?;
        info!(
            "Compressed dump {} -> {} ({:.1}% saved)",
            format_bytes(dump_size),
            format_bytes(stats.compressed_size),
            stats.ratio() * 100.0
        );

        Ok((packed, Some(stats.original_size), Some(stats.ratio())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::TableStats;
    use crate::process::testing::{dump_writing, exit, ok, ScriptedRunner};
    use async_trait::async_trait;
    use tempfile::TempDir;

    const DUMP: &[u8] = b"-- MySQL dump 10.13  Distrib 8.0.36\n\
        CREATE TABLE `tasks` (`id` int);\n\
        INSERT INTO `tasks` VALUES (1),(2),(3);\n";

    struct FixedSchema(Result<Vec<TableStats>>);

    #[async_trait]
    impl SchemaInspector for FixedSchema {
        async fn table_stats(&self) -> Result<Vec<TableStats>> {
            match &self.0 {
                Ok(t) => Ok(t.clone()),
                Err(e) => Err(BackupError::Integrity(e.to_string())),
            }
        }
    }

    fn archiver(runner: ScriptedRunner, schema: FixedSchema, codec: Compression) -> DatabaseArchiver {
        DatabaseArchiver::new(
            Arc::new(runner),
            Arc::new(schema),
            DatabaseConfig {
                name: "portal".to_string(),
                password: "pw".to_string(),
                ..Default::default()
            },
            DumpCompression {
                codec,
                level: 6,
                chunk_size: 1024 * 1024,
            },
        )
    }

    fn tables() -> FixedSchema {
        FixedSchema(Ok(vec![TableStats {
            name: "tasks".to_string(),
            rows: 3,
        }]))
    }

    #[test]
    fn test_dump_command_arguments() {
        let a = archiver(ScriptedRunner::new(), tables(), Compression::Gzip);
        let cmd = a.dump_command(Path::new("/b/database/portal.sql"));

        assert_eq!(cmd.program, "mysqldump");
        for flag in ["--single-transaction", "--routines", "--triggers", "--events"] {
            assert!(cmd.args.iter().any(|x| x == flag), "missing {}", flag);
        }
        assert!(cmd.args.contains(&"--default-character-set=utf8mb4".to_string()));
        assert_eq!(cmd.option_value("--result-file"), Some("/b/database/portal.sql"));
        assert_eq!(cmd.args.last().map(String::as_str), Some("portal"));
        assert!(cmd.args.iter().all(|x| !x.contains("pw")));
    }

    #[tokio::test]
    async fn test_compressed_dump_artifact() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on("mysqldump", dump_writing(DUMP));
        let a = archiver(runner, tables(), Compression::Gzip);

        let artifact = a.archive(temp.path()).await.unwrap();

        assert_eq!(artifact.file, "portal.sql.gz");
        assert!(artifact.compressed);
        assert_eq!(artifact.original_size, Some(DUMP.len() as u64));
        assert!(!temp.path().join("portal.sql").exists());
        let packed = temp.path().join("portal.sql.gz");
        assert_eq!(artifact.size, std::fs::metadata(&packed).unwrap().len());
        assert_eq!(artifact.checksum, calculate_checksum(&packed).unwrap());
        assert_eq!(artifact.rows, 3);
        assert_eq!(artifact.tables.len(), 1);
    }

    #[tokio::test]
    async fn test_uncompressed_dump_artifact() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on("mysqldump", dump_writing(DUMP));
        let a = archiver(runner, tables(), Compression::None);

        let artifact = a.archive(temp.path()).await.unwrap();
        assert_eq!(artifact.file, "portal.sql");
        assert!(!artifact.compressed);
        assert_eq!(artifact.size, DUMP.len() as u64);
        assert_eq!(artifact.compression_ratio, None);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_subprocess_failure() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on("mysqldump", |_| {
            Ok(exit(2, "mysqldump: Got error: 1045: Access denied"))
        });
        let a = archiver(runner, tables(), Compression::Gzip);

        match a.archive(temp.path()).await {
            Err(BackupError::Subprocess { code, output, .. }) => {
                assert_eq!(code, Some(2));
                assert!(output.contains("Access denied"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_dump_is_integrity_failure() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on("mysqldump", dump_writing(b""));
        let a = archiver(runner, tables(), Compression::Gzip);

        assert!(matches!(a.archive(temp.path()).await, Err(BackupError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_missing_dump_is_integrity_failure() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on("mysqldump", |_| Ok(ok("")));
        let a = archiver(runner, tables(), Compression::Gzip);

        assert!(matches!(a.archive(temp.path()).await, Err(BackupError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_schema_failure_does_not_fail_phase() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on("mysqldump", dump_writing(DUMP));
        let schema = FixedSchema(Err(BackupError::Integrity("no access".to_string())));
        let a = archiver(runner, schema, Compression::Zstd);

        let artifact = a.archive(temp.path()).await.unwrap();
        assert_eq!(artifact.file, "portal.sql.zst");
        assert!(artifact.tables.is_empty());
        assert_eq!(artifact.rows, 0);
    }
}
