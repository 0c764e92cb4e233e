//! Run summaries and their delivery.
//!
//! Every run produces a [`RunReport`]. The summary is always written to the
//! log; a configured webhook additionally receives the report as JSON.

use crate::config::ReportConfig;
use crate::executor::manifest::{DatabaseArtifact, FileArtifact, RunType};
use crate::transfer::progress::{format_bytes, format_duration};
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    /// Errors were recorded but at least one backup phase completed
    Partial,
    Failed,
}

impl RunStatus {
    /// `phase_completed` is true when a backup phase finished and verified.
    pub fn from_run(errors: &[String], phase_completed: bool) -> Self {
        match (errors.is_empty(), phase_completed) {
            (true, _) => RunStatus::Success,
            (false, true) => RunStatus::Partial,
            (false, false) => RunStatus::Failed,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "SUCCESS"),
            RunStatus::Partial => write!(f, "PARTIAL"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSummary {
    pub deleted: usize,
    pub freed_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub hostname: String,
    pub started_at: String,
    pub duration_secs: f64,
    pub total_size: u64,
    pub database: Option<DatabaseArtifact>,
    pub files: Option<FileArtifact>,
    pub retention: Option<RetentionSummary>,
    pub errors: Vec<String>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn subject(&self) -> String {
        format!(
            "[backup] {} {} run {} on {}",
            self.status, self.run_type, self.run_id, self.hostname
        )
    }

    /// Plain-text body listing status, type, duration, size and errors.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Status:   {}", self.status);
        let _ = writeln!(out, "Run:      {} ({})", self.run_id, self.run_type);
        let _ = writeln!(out, "Started:  {}", self.started_at);
        let _ = writeln!(
            out,
            "Duration: {}",
            format_duration(self.duration_secs.round() as u64)
        );
        let _ = writeln!(out, "Size:     {}", format_bytes(self.total_size));

        if let Some(db) = &self.database {
            let _ = writeln!(
                out,
                "Database: {} ({}, {} tables, {} rows)",
                db.file,
                format_bytes(db.size),
                db.tables.len(),
                db.rows
            );
        }
        if let Some(files) = &self.files {
            let _ = writeln!(
                out,
                "Files:    {} ({}, {} files from {})",
                files.file,
                format_bytes(files.size),
                files.count,
                format_bytes(files.original_size)
            );
        }
        if let Some(retention) = &self.retention {
            let _ = writeln!(
                out,
                "Cleanup:  {} expired runs removed, {} freed",
                retention.deleted,
                format_bytes(retention.freed_bytes)
            );
        }
        if !self.errors.is_empty() {
            let _ = writeln!(out, "Errors:");
            for e in &self.errors {
                let _ = writeln!(out, "  - {}", e);
            }
        }
        out
    }
}

/// Destination for run reports.
#[async_trait]
pub trait ReportNotifier: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, report: &RunReport) -> Result<()>;
}

pub struct LogNotifier;

#[async_trait]
impl ReportNotifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, report: &RunReport) -> Result<()> {
        let body = report.summary();
        if report.success() {
            info!("{}\n{}", report.subject(), body);
        } else {
            error!("{}\n{}", report.subject(), body);
        }
        Ok(())
    }
}

/// POSTs the JSON report to an HTTP endpoint.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ReportNotifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, report: &RunReport) -> Result<()> {
        let body = serde_json::json!({
            "subject": report.subject(),
            "summary": report.summary(),
            "report": report,
        });
        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        info!(url = %self.url, "Report delivered");
        Ok(())
    }
}

/// Fans a report out to every notifier. Delivery failures are logged only.
#[derive(Clone)]
pub struct Reporter {
    notifiers: Vec<Arc<dyn ReportNotifier>>,
}

impl Reporter {
    pub fn new(notifiers: Vec<Arc<dyn ReportNotifier>>) -> Self {
        Self { notifiers }
    }

    /// Log notifier always; webhook unless dry-run or unset.
    pub fn from_config(config: &ReportConfig) -> Self {
        let mut notifiers: Vec<Arc<dyn ReportNotifier>> = vec![Arc::new(LogNotifier)];
        match (&config.webhook_url, config.dry_run) {
            (Some(url), false) if !url.is_empty() => {
                notifiers.push(Arc::new(WebhookNotifier::new(url.clone())))
            }
            (Some(_), true) => info!("Dry run: report will only be logged"),
            _ => {}
        }
        Self::new(notifiers)
    }

    pub async fn deliver(&self, report: &RunReport) {
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(report).await {
                warn!("Report delivery via {} failed: {}", notifier.name(), e);
            }
        }
    }

    pub fn channels(&self) -> Vec<&str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every report it receives.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub reports: Mutex<Vec<RunReport>>,
    }

    impl RecordingNotifier {
        pub fn last(&self) -> Option<RunReport> {
            self.reports.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl ReportNotifier for RecordingNotifier {
        fn name(&self) -> &str {
            "recording"
        }

        async fn notify(&self, report: &RunReport) -> Result<()> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;
    use crate::utils::errors::BackupError;

    fn report(errors: Vec<String>) -> RunReport {
        RunReport {
            run_id: "2026-03-01_02-00-00".to_string(),
            run_type: RunType::Daily,
            status: RunStatus::from_run(&errors, false),
            hostname: "web-01".to_string(),
            started_at: "2026-03-01 02:00:00".to_string(),
            duration_secs: 75.2,
            total_size: 2048,
            database: None,
            files: None,
            retention: Some(RetentionSummary {
                deleted: 2,
                freed_bytes: 1024 * 1024,
            }),
            errors,
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl ReportNotifier for FailingNotifier {
        fn name(&self) -> &str {
            "failing"
        }

        async fn notify(&self, _report: &RunReport) -> Result<()> {
            Err(BackupError::Config("unreachable".to_string()))
        }
    }

    #[test]
    fn test_status_from_run() {
        let errs = vec!["Database backup failed".to_string()];
        assert_eq!(RunStatus::from_run(&[], false), RunStatus::Success);
        assert_eq!(RunStatus::from_run(&errs, true), RunStatus::Partial);
        assert_eq!(RunStatus::from_run(&errs, false), RunStatus::Failed);
    }

    #[test]
    fn test_summary_lists_errors() {
        let r = report(vec!["Database backup failed: exit 2".to_string()]);
        let text = r.summary();

        assert!(r.subject().contains("FAILED"));
        assert!(text.contains("Duration: 1m 15s"));
        assert!(text.contains("Size:     2.00 KB"));
        assert!(text.contains("2 expired runs removed, 1.00 MB freed"));
        assert!(text.contains("  - Database backup failed: exit 2"));
    }

    #[test]
    fn test_from_config_channels() {
        let plain = Reporter::from_config(&ReportConfig::default());
        assert_eq!(plain.channels(), vec!["log"]);

        let hooked = Reporter::from_config(&ReportConfig {
            webhook_url: Some("http://localhost:9/hook".to_string()),
            dry_run: false,
        });
        assert_eq!(hooked.channels(), vec!["log", "webhook"]);

        let dry = Reporter::from_config(&ReportConfig {
            webhook_url: Some("http://localhost:9/hook".to_string()),
            dry_run: true,
        });
        assert_eq!(dry.channels(), vec!["log"]);
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_stop_others() {
        let recorder = Arc::new(RecordingNotifier::default());
        let notifiers: Vec<Arc<dyn ReportNotifier>> = vec![Arc::new(FailingNotifier), recorder.clone()];
        let reporter = Reporter::new(notifiers);

        reporter.deliver(&report(vec![])).await;
        assert_eq!(recorder.last().unwrap().status, RunStatus::Success);
    }
}
