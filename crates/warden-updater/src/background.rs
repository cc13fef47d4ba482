//! Gating and selection for unattended update runs.

use tracing::{debug, info};

use crate::config::ScheduleConfig;
use crate::eligibility::UpdatePolicy;
use crate::model::UpdateCandidate;

/// Host environment predicates supplied by the platform layer.
pub trait EnvironmentProbe: Send + Sync {
    fn on_ac_power(&self) -> bool;
    fn on_wifi(&self) -> bool;
}

/// Probe with fixed answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticEnvironment {
    pub ac_power: bool,
    pub wifi: bool,
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self {
            ac_power: true,
            wifi: true,
        }
    }
}

impl EnvironmentProbe for StaticEnvironment {
    fn on_ac_power(&self) -> bool {
        self.ac_power
    }

    fn on_wifi(&self) -> bool {
        self.wifi
    }
}

/// Why a background run was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    OnBattery,
    NotOnWifi,
}

/// Preconditions checked once when a background run is triggered.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerGate {
    require_ac_power: bool,
    require_wifi: bool,
}

impl TriggerGate {
    pub fn new(require_ac_power: bool, require_wifi: bool) -> Self {
        Self {
            require_ac_power,
            require_wifi,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(config.require_ac_power, config.require_wifi)
    }

    /// `Ok(())` if a run may start now.
    pub fn check(&self, probe: &dyn EnvironmentProbe) -> Result<(), Deferral> {
        if self.require_ac_power && !probe.on_ac_power() {
            debug!("Deferring background run: on battery");
            return Err(Deferral::OnBattery);
        }
        if self.require_wifi && !probe.on_wifi() {
            debug!("Deferring background run: not on Wi-Fi");
            return Err(Deferral::NotOnWifi);
        }
        Ok(())
    }
}

/// Candidates an unattended run may install: compatible only, security
/// only when the policy asks for it, and nothing the policy suppresses.
pub fn select_background_candidates(
    candidates: &[UpdateCandidate],
    policy: &UpdatePolicy,
) -> Vec<UpdateCandidate> {
    let selected: Vec<UpdateCandidate> = candidates
        .iter()
        .filter(|c| c.is_compatible)
        .filter(|c| !policy.security_only || c.is_security)
        .filter(|c| !policy.suppresses(c))
        .cloned()
        .collect();

    info!(
        offered = candidates.len(),
        selected = selected.len(),
        security_only = policy.security_only,
        "Selected background installs"
    );
    selected
}
