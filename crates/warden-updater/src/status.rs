//! Observable fleet status.
//!
//! Worker tasks never mutate shared status directly. They send
//! [`StatusEvent`]s to a single coordinator task that owns the
//! [`FleetStatus`] value and publishes a fresh snapshot over a `watch`
//! channel after every event.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::install::InstallState;

/// Progress reported by scanning, checking and install workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    ScanStarted,
    ScanFinished { applications: usize },
    CheckStarted,
    CheckFinished { updates: usize },
    InstallQueued { identifier: String, version: String },
    Downloading { identifier: String, downloaded: u64, total: Option<u64> },
    InstallTransition { identifier: String, state: InstallState },
    InstallSucceeded { identifier: String, version: String },
    InstallFailed { identifier: String, error: String, fatal: bool },
}

/// What the fleet is doing overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Scanning,
    Checking,
    Installing,
}

/// Per-application install progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallProgress {
    pub version: String,
    pub state: InstallState,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of everything observable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetStatus {
    pub phase: Phase,
    pub applications: usize,
    pub available_updates: usize,
    pub installs: BTreeMap<String, InstallProgress>,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
}

impl FleetStatus {
    /// Fold one event into the snapshot.
    pub fn apply(&mut self, event: StatusEvent) {
        let now = Utc::now();
        match event {
            StatusEvent::ScanStarted => self.phase = Phase::Scanning,
            StatusEvent::ScanFinished { applications } => {
                self.applications = applications;
                self.phase = self.settled_phase();
            }
            StatusEvent::CheckStarted => self.phase = Phase::Checking,
            StatusEvent::CheckFinished { updates } => {
                self.available_updates = updates;
                self.last_check = Some(now);
                self.phase = self.settled_phase();
            }
            StatusEvent::InstallQueued { identifier, version } => {
                self.installs.insert(
                    identifier,
                    InstallProgress {
                        version,
                        state: InstallState::Idle,
                        downloaded: 0,
                        total: None,
                        error: None,
                        updated_at: now,
                    },
                );
                self.phase = Phase::Installing;
            }
            StatusEvent::Downloading { identifier, downloaded, total } => {
                if let Some(progress) = self.installs.get_mut(&identifier) {
                    progress.downloaded = downloaded;
                    progress.total = total;
                    progress.updated_at = now;
                }
            }
            StatusEvent::InstallTransition { identifier, state } => {
                if let Some(progress) = self.installs.get_mut(&identifier) {
                    progress.state = state;
                    progress.updated_at = now;
                }
            }
            StatusEvent::InstallSucceeded { identifier, .. } => {
                if let Some(progress) = self.installs.get_mut(&identifier) {
                    progress.state = InstallState::Confirmed;
                    progress.error = None;
                    progress.updated_at = now;
                }
                self.available_updates = self.available_updates.saturating_sub(1);
                self.phase = self.settled_phase();
            }
            StatusEvent::InstallFailed { identifier, error, .. } => {
                if let Some(progress) = self.installs.get_mut(&identifier) {
                    if !progress.state.is_terminal() {
                        progress.state = InstallState::Failed;
                    }
                    progress.error = Some(error.clone());
                    progress.updated_at = now;
                }
                self.last_error = Some(format!("{identifier}: {error}"));
                self.phase = self.settled_phase();
            }
        }
    }

    /// Installing while any install is unfinished, otherwise idle.
    fn settled_phase(&self) -> Phase {
        if self.installs.values().any(|p| !p.state.is_terminal()) {
            Phase::Installing
        } else {
            Phase::Idle
        }
    }

    pub fn in_flight(&self) -> usize {
        self.installs.values().filter(|p| !p.state.is_terminal()).count()
    }
}

/// Cheap, cloneable sender half. Reporting never blocks or fails.
#[derive(Debug, Clone, Default)]
pub struct StatusReporter {
    tx: Option<mpsc::UnboundedSender<StatusEvent>>,
}

impl StatusReporter {
    /// A reporter that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, event: StatusEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("Status coordinator has stopped");
            }
        }
    }
}

/// Handle to a running coordinator.
#[derive(Debug)]
pub struct StatusCoordinator {
    reporter: StatusReporter,
    snapshots: watch::Receiver<FleetStatus>,
    task: JoinHandle<FleetStatus>,
}

impl StatusCoordinator {
    /// Spawn the coordinator task on the current runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StatusEvent>();
        let (publish, snapshots) = watch::channel(FleetStatus::default());

        let task = tokio::spawn(async move {
            let mut status = FleetStatus::default();
            while let Some(event) = rx.recv().await {
                status.apply(event);
                publish.send_replace(status.clone());
            }
            status
        });

        Self {
            reporter: StatusReporter { tx: Some(tx) },
            snapshots,
            task,
        }
    }

    pub fn reporter(&self) -> StatusReporter {
        self.reporter.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FleetStatus> {
        self.snapshots.clone()
    }

    pub fn current(&self) -> FleetStatus {
        self.snapshots.borrow().clone()
    }

    /// Stop accepting events and return the final status once every
    /// reporter clone has been dropped.
    pub async fn shutdown(self) -> FleetStatus {
        drop(self.reporter);
        self.task.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: &str) -> StatusEvent {
        StatusEvent::InstallQueued {
            identifier: id.into(),
            version: "2.0".into(),
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_current_status() {
        let coordinator = StatusCoordinator::spawn();
        let reporter = coordinator.reporter();
        reporter.report(StatusEvent::ScanStarted);
        reporter.report(StatusEvent::ScanFinished { applications: 3 });
        reporter.report(queued("a"));

        let mut late = coordinator.subscribe();
        let seen = late.wait_for(|status| status.installs.contains_key("a")).await.unwrap().clone();
        assert_eq!(seen.applications, 3);
        assert_eq!(seen.phase, Phase::Installing);
        assert_eq!(coordinator.current(), seen);

        drop(reporter);
        assert_eq!(coordinator.shutdown().await, seen);
    }

    #[test]
    fn test_apply_tracks_phases() {
        let mut status = FleetStatus::default();
        status.apply(StatusEvent::ScanStarted);
        assert_eq!(status.phase, Phase::Scanning);
        status.apply(StatusEvent::ScanFinished { applications: 4 });
        status.apply(StatusEvent::CheckStarted);
        status.apply(StatusEvent::CheckFinished { updates: 2 });
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.applications, 4);
        assert_eq!(status.available_updates, 2);
        assert!(status.last_check.is_some());
    }

    #[test]
    fn test_install_lifecycle() {
        let mut status = FleetStatus::default();
        status.apply(StatusEvent::CheckFinished { updates: 2 });
        status.apply(queued("a"));
        status.apply(queued("b"));
        status.apply(StatusEvent::InstallTransition {
            identifier: "a".into(),
            state: InstallState::Swapped,
        });
        assert_eq!(status.in_flight(), 2);

        status.apply(StatusEvent::InstallSucceeded {
            identifier: "a".into(),
            version: "2.0".into(),
        });
        assert_eq!(status.phase, Phase::Installing);
        status.apply(StatusEvent::InstallFailed {
            identifier: "b".into(),
            error: "checksum mismatch".into(),
            fatal: false,
        });

        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.available_updates, 1);
        assert_eq!(status.installs["a"].state, InstallState::Confirmed);
        assert_eq!(status.installs["b"].state, InstallState::Failed);
        assert_eq!(status.last_error.as_deref(), Some("b: checksum mismatch"));
    }

    #[test]
    fn test_rolled_back_state_survives_failure_event() {
        let mut status = FleetStatus::default();
        status.apply(queued("a"));
        status.apply(StatusEvent::InstallTransition {
            identifier: "a".into(),
            state: InstallState::RolledBack,
        });
        status.apply(StatusEvent::InstallFailed {
            identifier: "a".into(),
            error: "checksum mismatch".into(),
            fatal: false,
        });
        assert_eq!(status.installs["a"].state, InstallState::RolledBack);
    }

    #[tokio::test]
    async fn test_coordinator_publishes_snapshots() {
        let coordinator = StatusCoordinator::spawn();
        let mut rx = coordinator.subscribe();
        let reporter = coordinator.reporter();

        reporter.report(StatusEvent::ScanFinished { applications: 7 });
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().applications, 7);

        let from_worker = reporter.clone();
        tokio::spawn(async move { from_worker.report(queued("x")) })
            .await
            .unwrap();
        drop(reporter);

        let final_status = coordinator.shutdown().await;
        assert_eq!(final_status.applications, 7);
        assert!(final_status.installs.contains_key("x"));
    }

    #[test]
    fn test_disabled_reporter_is_silent() {
        StatusReporter::disabled().report(StatusEvent::ScanStarted);
    }
}
