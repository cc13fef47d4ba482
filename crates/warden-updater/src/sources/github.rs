//! GitHub release API source.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::UpdateSource;
use crate::download::Downloader;
use crate::error::UpdateError;
use crate::model::{InstalledApplication, SourceKind, UpdateCandidate};
use crate::version;

/// Release API records, declared once for every consumer.
pub mod wire {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Release {
        pub tag_name: String,
        #[serde(default)]
        pub name: Option<String>,
        #[serde(default)]
        pub body: Option<String>,
        #[serde(default)]
        pub draft: bool,
        #[serde(default)]
        pub prerelease: bool,
        pub html_url: String,
        #[serde(default)]
        pub published_at: Option<DateTime<Utc>>,
        #[serde(default)]
        pub assets: Vec<Asset>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Asset {
        pub name: String,
        pub browser_download_url: String,
        #[serde(default)]
        pub size: u64,
        #[serde(default)]
        pub content_type: Option<String>,
    }
}

use wire::{Asset, Release};

/// Asset name fragments naming the macOS build.
const PLATFORM_HINTS: &[&str] = &["mac", "macos", "darwin", "osx", "universal"];

/// Extensions the installer can handle.
const INSTALLABLE_EXTENSIONS: &[&str] = &[".dmg", ".pkg", ".zip"];

/// Parse a release listing.
pub fn parse_releases(json: &str) -> Result<Vec<Release>, UpdateError> {
    Ok(serde_json::from_str(json)?)
}

/// The newest stable release; listings are ordered newest first.
pub fn latest_stable(releases: &[Release]) -> Option<&Release> {
    releases.iter().find(|r| !r.draft && !r.prerelease)
}

fn asset_rank(asset: &Asset) -> u8 {
    let name = asset.name.to_lowercase();
    let hinted = PLATFORM_HINTS.iter().any(|hint| name.contains(hint));
    let installable = INSTALLABLE_EXTENSIONS.iter().any(|ext| name.ends_with(ext));
    match (installable, hinted) {
        (true, true) => 3,
        (true, false) => 2,
        (false, true) => 1,
        (false, false) => 0,
    }
}

/// Best downloadable asset for this platform, first one on ties.
pub fn select_asset(assets: &[Asset]) -> Option<&Asset> {
    let mut best: Option<(&Asset, u8)> = None;
    for asset in assets {
        let rank = asset_rank(asset);
        if rank > 0 && best.map_or(true, |(_, r)| rank > r) {
            best = Some((asset, rank));
        }
    }
    best.map(|(asset, _)| asset)
}

/// Build a candidate for `app` from a release listing.
pub fn candidate_from_releases(app: &InstalledApplication, releases: &[Release]) -> Option<UpdateCandidate> {
    let release = latest_stable(releases)?;
    let available = version::normalize(&release.tag_name);
    if available.is_empty() || !version::is_newer(available, &app.version) {
        debug!(app = %app.identifier, tag = %release.tag_name, "Latest release is not newer");
        return None;
    }

    let url = select_asset(&release.assets)
        .map(|asset| asset.browser_download_url.clone())
        .unwrap_or_else(|| release.html_url.clone());

    let mut candidate = UpdateCandidate::new(app.clone(), available, url, SourceKind::ReleaseApi);
    if let Some(body) = release.body.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        candidate = candidate.with_changelog(body);
    }
    Some(candidate)
}

/// `owner/name` with exactly two non-empty parts.
pub fn is_repository_slug(repo: &str) -> bool {
    let mut parts = repo.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
    )
}

/// Release API client for applications that name a repository.
#[derive(Debug, Clone)]
pub struct ReleaseApiClient {
    downloader: Downloader,
    api_base: String,
    token: Option<String>,
}

impl ReleaseApiClient {
    pub fn new(downloader: Downloader, api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            downloader,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn releases_url(&self, repo: &str) -> String {
        format!("{}/repos/{}/releases", self.api_base, repo)
    }
}

#[async_trait]
impl UpdateSource for ReleaseApiClient {
    fn kind(&self) -> SourceKind {
        SourceKind::ReleaseApi
    }

    fn applies_to(&self, app: &InstalledApplication) -> bool {
        app.repository.as_deref().is_some_and(is_repository_slug)
    }

    async fn fetch_candidate(&self, app: &InstalledApplication) -> Option<UpdateCandidate> {
        let repo = app.repository.as_deref()?;
        let url = self.releases_url(repo);

        let body = match self.downloader.fetch_with_token(&url, self.token.as_deref()).await {
            Ok(body) => body,
            Err(e) => {
                debug!(app = %app.identifier, repo, error = %e, "Release listing fetch failed");
                return None;
            }
        };

        match parse_releases(&String::from_utf8_lossy(&body)) {
            Ok(releases) => candidate_from_releases(app, &releases),
            Err(e) => {
                warn!(app = %app.identifier, repo, error = %e, "Unparseable release listing");
                None
            }
        }
    }
}
