//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, warn};

use warden_updater::{
    default_config_path, default_data_dir, BackgroundRun, CancelToken, InstallOrchestrator, InstalledApplication,
    JsonInventoryScanner, Scanner, StaticEnvironment, TriggerGate, UpdateConfig,
};

use crate::output::{OutputFormat, OutputFormatter};
use crate::ExitCode;

/// Warden - keep installed applications up to date
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about = "Check, install and roll back application updates")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: table, json, quiet
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true, env = "WARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Inventory JSON written by the scanner
    #[arg(long, global = true, env = "WARDEN_INVENTORY")]
    pub inventory: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check every inventoried application for updates
    Check,
    /// Install the available update for one application
    Install(InstallArgs),
    /// Install eligible updates unattended
    Auto(AutoArgs),
    /// List backups for an application
    Backups(BackupsArgs),
    /// Restore a backup
    Rollback(RollbackArgs),
    /// Apply backup retention to every application
    Prune,
    /// Show the incompatibility rules
    Rules(RulesArgs),
    /// Write a default configuration file
    Init,
}

#[derive(Parser, Debug)]
pub struct InstallArgs {
    /// Application identifier
    pub identifier: String,

    /// Install even if the update is flagged as risky
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct AutoArgs {
    /// Host is running on battery
    #[arg(long)]
    pub on_battery: bool,

    /// Host is not on Wi-Fi
    #[arg(long)]
    pub no_wifi: bool,
}

#[derive(Parser, Debug)]
pub struct BackupsArgs {
    /// Application identifier
    pub identifier: String,
}

#[derive(Parser, Debug)]
pub struct RollbackArgs {
    /// Application identifier
    pub identifier: String,

    /// Backup version to restore (default: newest)
    #[arg(long)]
    pub version: Option<String>,
}

#[derive(Parser, Debug)]
pub struct RulesArgs {
    /// Refresh from the configured remote list first
    #[arg(long)]
    pub refresh: bool,
}

#[derive(Serialize)]
struct CountOutput {
    removed: usize,
}

#[derive(Serialize)]
struct PathOutput {
    path: PathBuf,
}

impl Cli {
    fn inventory_path(&self) -> PathBuf {
        self.inventory
            .clone()
            .unwrap_or_else(|| default_data_dir().join("inventory.json"))
    }

    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: UpdateConfig) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(self.output, self.verbose);
        let scanner = Arc::new(JsonInventoryScanner::new(self.inventory_path()));

        if let Commands::Init = self.command {
            let path = self.config.clone().unwrap_or_else(default_config_path);
            if path.exists() {
                formatter.warning(&format!("{} already exists", path.display()));
            } else {
                config
                    .save_to_file(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
                formatter.success(&format!("Wrote {}", path.display()));
            }
            print_nonempty(formatter.format_success(&PathOutput { path }, "init"));
            return Ok(ExitCode::Success);
        }

        let orchestrator = InstallOrchestrator::from_config(&config, scanner.clone())?;

        match self.command {
            Commands::Check => {
                formatter.progress("Checking for updates");
                let report = orchestrator.check().await?;
                print_nonempty(formatter.format_candidates(&report.candidates));
                Ok(ExitCode::Success)
            }
            Commands::Install(args) => {
                let report = orchestrator.check().await?;
                let candidate = report
                    .candidates
                    .iter()
                    .find(|c| c.identifier() == args.identifier)
                    .ok_or_else(|| anyhow::anyhow!("no update available for {}", args.identifier))?;
                if !candidate.is_compatible && !args.force {
                    formatter.warning(&format!(
                        "{} {} is flagged as risky; pass --force to install it",
                        candidate.application.name, candidate.version
                    ));
                    return Ok(ExitCode::InvalidInput);
                }

                let cancel = cancel_on_ctrl_c();
                formatter.progress(&format!("Installing {} {}", candidate.application.name, candidate.version));
                let outcome = orchestrator.install(candidate, &cancel).await?;
                print_nonempty(formatter.format_outcomes(std::slice::from_ref(&outcome), "install"));
                Ok(ExitCode::Success)
            }
            Commands::Auto(args) => {
                let gate = TriggerGate::from_config(&config.schedule);
                let environment = StaticEnvironment {
                    ac_power: !args.on_battery,
                    wifi: !args.no_wifi,
                };
                let cancel = cancel_on_ctrl_c();
                match orchestrator.run_background(&gate, &environment, &cancel).await? {
                    BackgroundRun::Deferred(reason) => {
                        formatter.warning(&format!("Deferred: {reason:?}"));
                        Ok(ExitCode::Success)
                    }
                    BackgroundRun::Completed(results) => {
                        let mut code = ExitCode::Success;
                        let mut installed = Vec::new();
                        for (identifier, result) in results {
                            match result {
                                Ok(outcome) => installed.push(outcome),
                                Err(e) => {
                                    formatter.warning(&format!("{identifier}: {e}"));
                                    code = worse(code, ExitCode::from_update_error(&e));
                                }
                            }
                        }
                        print_nonempty(formatter.format_outcomes(&installed, "auto"));
                        Ok(code)
                    }
                }
            }
            Commands::Backups(args) => {
                let backups = orchestrator.store().list(&args.identifier)?;
                print_nonempty(formatter.format_backups(&args.identifier, &backups));
                Ok(ExitCode::Success)
            }
            Commands::Rollback(args) => {
                let app = find_application(scanner.as_ref(), &args.identifier).await?;
                let record = orchestrator.rollback(&app, args.version.as_deref()).await?;
                formatter.success(&format!("Restored {} {}", app.name, record.version));
                print_nonempty(formatter.format_success(&record, "rollback"));
                Ok(ExitCode::Success)
            }
            Commands::Prune => {
                let removed = orchestrator.store().prune_all()?;
                formatter.success(&format!("Removed {removed} old backup(s)"));
                print_nonempty(formatter.format_success(&CountOutput { removed }, "prune"));
                Ok(ExitCode::Success)
            }
            Commands::Rules(args) => {
                if args.refresh {
                    match orchestrator.refresh_rules().await {
                        Ok(Some(count)) => formatter.progress(&format!("Loaded {count} rules")),
                        Ok(None) => formatter.warning("No remote rule list configured"),
                        Err(e) => formatter.warning(&format!("Refresh failed, using current rules: {e}")),
                    }
                }
                let rules = orchestrator.rules().snapshot();
                print_nonempty(formatter.format_rules(&rules));
                Ok(ExitCode::Success)
            }
            Commands::Init => Ok(ExitCode::Success),
        }
    }
}

async fn find_application(scanner: &dyn Scanner, identifier: &str) -> anyhow::Result<InstalledApplication> {
    let apps = scanner.scan().await?;
    apps.into_iter()
        .find(|app| app.identifier == identifier)
        .ok_or_else(|| anyhow::anyhow!("{identifier} is not in the inventory"))
}

/// Cancel token tripped by the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted; stopping at the next safe point");
                trip.cancel();
            }
            Err(e) => debug!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });
    cancel
}

/// Keep the more serious of two exit codes.
fn worse(current: ExitCode, next: ExitCode) -> ExitCode {
    if current == ExitCode::Success || next == ExitCode::RollbackFailed {
        next
    } else {
        current
    }
}

fn print_nonempty(text: String) {
    if !text.is_empty() {
        println!("{text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "warden",
            "rollback",
            "com.example.notes",
            "--version",
            "1.0",
            "--output",
            "json",
            "--inventory",
            "/tmp/inventory.json",
        ])
        .unwrap();

        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.inventory_path(), PathBuf::from("/tmp/inventory.json"));
        match cli.command {
            Commands::Rollback(args) => {
                assert_eq!(args.identifier, "com.example.notes");
                assert_eq!(args.version.as_deref(), Some("1.0"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_install_requires_identifier() {
        assert!(Cli::try_parse_from(["warden", "install"]).is_err());
        let cli = Cli::try_parse_from(["warden", "install", "com.a", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Install(InstallArgs { force: true, .. })));
    }

    #[test]
    fn test_rejects_unknown_output() {
        assert!(Cli::try_parse_from(["warden", "check", "--output", "xml"]).is_err());
    }

    #[test]
    fn test_worse_keeps_most_serious() {
        assert_eq!(worse(ExitCode::Success, ExitCode::Timeout), ExitCode::Timeout);
        assert_eq!(worse(ExitCode::Timeout, ExitCode::NetworkFailed), ExitCode::Timeout);
        assert_eq!(worse(ExitCode::Timeout, ExitCode::RollbackFailed), ExitCode::RollbackFailed);
    }

    #[tokio::test]
    async fn test_init_writes_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cli = Cli::try_parse_from([
            "warden",
            "init",
            "--output",
            "quiet",
            "--config",
            path.to_str().unwrap(),
        ])
        .unwrap();

        let code = cli.execute_with_config(UpdateConfig::default()).await.unwrap();
        assert_eq!(code, ExitCode::Success);
        let written = UpdateConfig::load_from_file(&path).unwrap();
        assert_eq!(written.rollback.max_backups, UpdateConfig::default().rollback.max_backups);
    }
}
