//! Rendering of command results
//!
//! `table` prints comfy tables for people, `json` wraps every result in
//! [`JsonResponse`] for scripts, and `quiet` leaves only the exit code.

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use warden_updater::{BackupRecord, IncompatibilityRule, InstallOutcome, UpdateCandidate};

use crate::ExitCode;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Envelope shared by every `--output json` result
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success_with_command(data: T, command: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: Some(command.to_string()),
            exit_code: None,
        }
    }
}

impl JsonResponse<()> {
    pub fn error(message: &str, code: ExitCode) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: None,
            exit_code: Some(code.into()),
        }
    }
}

/// Candidate row shared by the table and JSON forms.
#[derive(Debug, Serialize)]
pub struct CandidateOutput {
    pub identifier: String,
    pub name: String,
    pub installed: String,
    pub available: String,
    pub source: String,
    pub security: bool,
    pub compatible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl From<&UpdateCandidate> for CandidateOutput {
    fn from(c: &UpdateCandidate) -> Self {
        Self {
            identifier: c.identifier().to_string(),
            name: c.application.name.clone(),
            installed: c.application.version.clone(),
            available: c.version.clone(),
            source: c.source.to_string(),
            security: c.is_security,
            compatible: c.is_compatible,
            summary: c.summary.clone(),
        }
    }
}

/// Renders results in the selected [`OutputFormat`]
pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    pub fn format_candidates(&self, candidates: &[UpdateCandidate]) -> String {
        let rows: Vec<CandidateOutput> = candidates.iter().map(CandidateOutput::from).collect();
        match self.format {
            OutputFormat::Table => candidates_table(&rows),
            OutputFormat::Json => self.to_json_response(&rows, "check"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_outcomes(&self, outcomes: &[InstallOutcome], command: &str) -> String {
        match self.format {
            OutputFormat::Table => {
                if outcomes.is_empty() {
                    return "Nothing installed.".to_string();
                }
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Application", "Version", "Method", "Backup"]);
                for outcome in outcomes {
                    table.add_row(vec![
                        outcome.identifier.clone(),
                        outcome.version.clone(),
                        format!("{:?}", outcome.method),
                        outcome
                            .backup
                            .as_ref()
                            .map(|b| b.version.clone())
                            .unwrap_or_else(|| "-".to_string()),
                    ]);
                }
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(&outcomes, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_backups(&self, identifier: &str, backups: &[BackupRecord]) -> String {
        match self.format {
            OutputFormat::Table => {
                if backups.is_empty() {
                    return format!("No backups for {identifier}.");
                }
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Version", "Created", "Checksum", "Location"]);
                for backup in backups {
                    table.add_row(vec![
                        backup.version.clone(),
                        backup.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        backup.checksum.chars().take(16).collect::<String>(),
                        backup.location.display().to_string(),
                    ]);
                }
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(&backups, "backups"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_rules(&self, rules: &[IncompatibilityRule]) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Applications", "Affected", "Fixed in", "Severity", "Reason"]);
                for rule in rules {
                    let apps = rule
                        .identifiers
                        .iter()
                        .chain(rule.name_patterns.iter())
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ");
                    table.add_row(vec![
                        apps,
                        rule.affected_versions.join(", "),
                        rule.fixed_in.clone().unwrap_or_else(|| "-".to_string()),
                        rule.severity.to_string(),
                        rule.reason.clone(),
                    ]);
                }
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(&rules, "rules"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Generic structured result; tables print nothing here.
    pub fn format_success<T: Serialize>(&self, data: &T, command: &str) -> String {
        match self.format {
            OutputFormat::Json => self.to_json_response(data, command),
            OutputFormat::Table | OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_error_with_code(&self, error: &str, code: ExitCode) -> String {
        match self.format {
            OutputFormat::Table => format!("Error: {error}"),
            OutputFormat::Json => to_json(&JsonResponse::<()>::error(error, code)),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Progress line, verbose table mode only.
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    pub fn warning(&self, message: &str) {
        if self.format == OutputFormat::Table {
            eprintln!("⚠ {message}");
        }
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        to_json(&JsonResponse::success_with_command(value, command))
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
}

fn candidates_table(rows: &[CandidateOutput]) -> String {
    if rows.is_empty() {
        return "Everything is up to date.".to_string();
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Application", "Installed", "Available", "Source", "Notes"]);
    for row in rows {
        let mut notes = Vec::new();
        if row.security {
            notes.push("security".to_string());
        }
        if !row.compatible {
            notes.push("risky".to_string());
        }
        if let Some(summary) = &row.summary {
            notes.push(summary.clone());
        }
        table.add_row(vec![
            row.name.clone(),
            row.installed.clone(),
            row.available.clone(),
            row.source.clone(),
            notes.join("; "),
        ]);
    }
    table.to_string()
}
