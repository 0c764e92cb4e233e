//! Schema statistics for manifest enrichment.

use crate::config::DatabaseConfig;
use crate::executor::manifest::TableStats;
use crate::process::{CommandRunner, CommandSpec};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Source of table names and row counts for the backed-up database.
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    async fn table_stats(&self) -> Result<Vec<TableStats>>;
}

/// Queries the server through its command-line client.
pub struct MysqlSchemaInspector {
    runner: Arc<dyn CommandRunner>,
    db: DatabaseConfig,
}

impl MysqlSchemaInspector {
    pub fn new(runner: Arc<dyn CommandRunner>, db: DatabaseConfig) -> Self {
        Self { runner, db }
    }

    async fn query(&self, sql: &str) -> Result<String> {
        let cmd = client_command(&self.db)
            .arg("--batch")
            .arg("--skip-column-names")
            .arg(format!("--execute={}", sql))
            .arg(&self.db.name);
        let output = self.runner.run(&cmd).await?.check(&self.db.client_command)?;
        Ok(output.output)
    }
}

#[async_trait]
impl SchemaInspector for MysqlSchemaInspector {
    async fn table_stats(&self) -> Result<Vec<TableStats>> {
        let listing = self
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
            )
            .await?;

        let tables: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        if tables.is_empty() {
            return Ok(Vec::new());
        }

        let counts = self.query(&count_query(&tables)).await?;
        parse_counts(&counts)
    }
}

/// Client invocation carrying connection parameters; the password travels in
/// `MYSQL_PWD`.
pub fn client_command(db: &DatabaseConfig) -> CommandSpec {
    let mut cmd = CommandSpec::new(&db.client_command)
        .arg(format!("--host={}", db.host))
        .arg(format!("--port={}", db.port))
        .arg(format!("--user={}", db.user))
        .arg(format!("--default-character-set={}", db.charset));
    if !db.password.is_empty() {
        cmd = cmd.env("MYSQL_PWD", &db.password);
    }
    cmd
}

fn count_query(tables: &[String]) -> String {
    tables
        .iter()
        .map(|t| format!("SELECT {}, COUNT(*) FROM {}", quote_literal(t), quote_ident(t)))
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

fn parse_counts(output: &str) -> Result<Vec<TableStats>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let (name, rows) = line
                .rsplit_once('\t')
                .ok_or_else(|| BackupError::Integrity(format!("unexpected count row: {}", line)))?;
            let rows = rows
                .trim()
                .parse()
                .map_err(|_| BackupError::Integrity(format!("bad row count for {}: {}", name, rows)))?;
            Ok(TableStats {
                name: name.to_string(),
                rows,
            })
        })
        .collect()
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{exit, ok, ScriptedRunner};

    fn db() -> DatabaseConfig {
        DatabaseConfig {
            password: "pw".to_string(),
            name: "portal".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
        assert_eq!(
            count_query(&["a".to_string(), "b".to_string()]),
            "SELECT 'a', COUNT(*) FROM `a` UNION ALL SELECT 'b', COUNT(*) FROM `b`"
        );
    }

    #[test]
    fn test_client_command_keeps_password_out_of_args() {
        let cmd = client_command(&db());
        assert!(cmd.args.iter().all(|a| !a.contains("pw")));
        assert!(cmd.env.contains(&("MYSQL_PWD".to_string(), "pw".to_string())));
    }

    #[tokio::test]
    async fn test_table_stats() {
        let runner = ScriptedRunner::new().on("mysql", |cmd| {
            let sql = cmd.option_value("--execute").unwrap_or_default();
            if sql.contains("information_schema") {
                Ok(ok("tasks\nusers\n"))
            } else {
                Ok(ok("tasks\t40\nusers\t2\n"))
            }
        });
        let inspector = MysqlSchemaInspector::new(Arc::new(runner), db());

        let stats = inspector.table_stats().await.unwrap();
        assert_eq!(
            stats,
            vec![
                TableStats { name: "tasks".to_string(), rows: 40 },
                TableStats { name: "users".to_string(), rows: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_table_stats_propagates_client_failure() {
        let runner = ScriptedRunner::new().on("mysql", |_| Ok(exit(1, "ERROR 2002")));
        let inspector = MysqlSchemaInspector::new(Arc::new(runner), db());

        let result = inspector.table_stats().await;
        assert!(matches!(result, Err(BackupError::Subprocess { .. })));
    }
}
