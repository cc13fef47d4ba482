//! Code signature verification for resolved bundles.
//!
//! Runs before anything is staged, so a bundle that fails here never
//! touches the installed application.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::SecurityConfig;
use crate::error::UpdateError;
use crate::executor::SafeExecutor;

/// Verifies the code signature of an application bundle.
#[async_trait]
pub trait CodeSignatureVerifier: Send + Sync {
    /// `Ok(())` if the bundle is validly signed by an accepted signer.
    async fn verify(&self, bundle: &Path) -> Result<(), UpdateError>;

    /// Description of this verifier for logging.
    fn description(&self) -> &str;
}

/// `codesign`-based verifier, optionally pinning a team identifier and
/// asking Gatekeeper for an assessment.
#[derive(Debug, Clone)]
pub struct CodesignVerifier {
    executor: Arc<SafeExecutor>,
    timeout: Duration,
    expected_team_id: Option<String>,
    assess: bool,
}

impl CodesignVerifier {
    pub fn new(executor: Arc<SafeExecutor>, timeout: Duration) -> Self {
        Self {
            executor,
            timeout,
            expected_team_id: None,
            assess: false,
        }
    }

    /// Verifier with the team pin and Gatekeeper setting from `config`.
    pub fn from_config(executor: Arc<SafeExecutor>, timeout: Duration, config: &SecurityConfig) -> Self {
        let mut verifier = Self::new(executor, timeout);
        if let Some(team_id) = config.team_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            verifier = verifier.with_team_id(team_id);
        }
        if config.gatekeeper_assessment {
            verifier = verifier.with_gatekeeper_assessment();
        }
        verifier
    }

    /// Require the signature to carry this 10-character team identifier.
    pub fn with_team_id(mut self, team_id: impl Into<String>) -> Self {
        self.expected_team_id = Some(team_id.into());
        self
    }

    /// Also run `spctl --assess`.
    pub fn with_gatekeeper_assessment(mut self) -> Self {
        self.assess = true;
        self
    }

    async fn run(&self, tool: &str, args: &[&str]) -> Result<crate::executor::ExecOutput, UpdateError> {
        self.executor.execute(tool, args, self.timeout, None).await
    }
}

/// `TeamIdentifier=` value from `codesign -d --verbose=2` output.
pub fn parse_team_identifier(output: &str) -> Option<&str> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("TeamIdentifier="))
        .map(str::trim)
        .filter(|id| !id.is_empty() && *id != "not set")
}

#[async_trait]
impl CodeSignatureVerifier for CodesignVerifier {
    async fn verify(&self, bundle: &Path) -> Result<(), UpdateError> {
        let path = bundle.to_string_lossy();

        let check = self
            .run("codesign", &["--verify", "--deep", "--strict", &*path])
            .await?;
        if !check.success() {
            return Err(UpdateError::SignatureVerificationFailed(format!(
                "codesign rejected {}: {}",
                path,
                check.stderr.trim()
            )));
        }

        if let Some(expected) = &self.expected_team_id {
            let details = self.run("codesign", &["-d", "--verbose=2", &*path]).await?;
            // codesign prints signature details on stderr
            let team = parse_team_identifier(&details.stderr).or_else(|| parse_team_identifier(&details.stdout));
            match team {
                Some(team) if team == expected => debug!(team, path = %path, "Team ID verified"),
                Some(team) => {
                    return Err(UpdateError::SignatureVerificationFailed(format!(
                        "team ID mismatch: expected {expected}, got {team}"
                    )))
                }
                None => {
                    return Err(UpdateError::SignatureVerificationFailed(
                        "could not extract team ID from signature".to_string(),
                    ))
                }
            }
        }

        if self.assess {
            let assessed = self
                .run("spctl", &["--assess", "--type", "execute", "-v", &*path])
                .await?;
            if !assessed.success() {
                return Err(UpdateError::SignatureVerificationFailed(format!(
                    "Gatekeeper assessment failed: {}",
                    assessed.stderr.trim()
                )));
            }
        }

        debug!(path = %path, "Code signature verified");
        Ok(())
    }

    fn description(&self) -> &str {
        "macOS codesign"
    }
}
