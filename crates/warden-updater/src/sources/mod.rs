//! Update source clients.
//!
//! A source answers "is there something newer for this application?".
//! Per-application sources implement [`UpdateSource`]; the package manager,
//! which answers for every managed application in one call, implements
//! [`BatchUpdateSource`]. Neither returns errors: a failing feed, API or
//! command means "no candidate from this source this cycle".

pub mod github;
pub mod registry;
pub mod sparkle;

use async_trait::async_trait;

use crate::model::{InstalledApplication, SourceKind, UpdateCandidate};

pub use github::ReleaseApiClient;
pub use registry::PackageRegistryClient;
pub use sparkle::SparkleFeedClient;

/// A source queried once per application.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Whether this source has enough hints to query `app`.
    fn applies_to(&self, app: &InstalledApplication) -> bool;

    /// The newest version offered for `app`, if it is newer than installed.
    async fn fetch_candidate(&self, app: &InstalledApplication) -> Option<UpdateCandidate>;
}

/// A source queried once for a whole inventory.
#[async_trait]
pub trait BatchUpdateSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Candidates for the subset of `apps` this source manages.
    async fn fetch_batch(&self, apps: &[InstalledApplication]) -> Vec<UpdateCandidate>;
}
