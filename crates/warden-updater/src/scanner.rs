//! Inventory snapshots of installed applications.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::UpdateError;
use crate::model::InstalledApplication;

/// Produces an inventory snapshot on demand. Scanning never mutates what
/// it reads.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self) -> Result<Vec<InstalledApplication>, UpdateError>;
}

/// Collapse duplicate identifiers, keeping the first occurrence.
pub fn dedup_inventory(apps: Vec<InstalledApplication>) -> Vec<InstalledApplication> {
    let mut seen = HashSet::with_capacity(apps.len());
    apps.into_iter()
        .filter(|app| {
            let first = seen.insert(app.identifier.clone());
            if !first {
                debug!(app = %app.identifier, path = %app.path.display(), "Dropping duplicate inventory entry");
            }
            first
        })
        .collect()
}

/// Either a bare array of applications or `{ "applications": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum InventoryDocument {
    List(Vec<InstalledApplication>),
    Wrapped { applications: Vec<InstalledApplication> },
}

/// Parse an inventory document and dedup it.
pub fn parse_inventory(json: &str) -> Result<Vec<InstalledApplication>, UpdateError> {
    let apps = match serde_json::from_str::<InventoryDocument>(json)? {
        InventoryDocument::List(apps) => apps,
        InventoryDocument::Wrapped { applications } => applications,
    };
    Ok(dedup_inventory(apps))
}

/// Reads the inventory from a JSON file written by an external scanner.
#[derive(Debug, Clone)]
pub struct JsonInventoryScanner {
    path: PathBuf,
}

impl JsonInventoryScanner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Scanner for JsonInventoryScanner {
    async fn scan(&self) -> Result<Vec<InstalledApplication>, UpdateError> {
        let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Cannot read inventory");
            e
        })?;
        let apps = parse_inventory(&json)?;
        debug!(path = %self.path.display(), count = apps.len(), "Inventory loaded");
        Ok(apps)
    }
}

/// Fixed inventory, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticScanner(pub Vec<InstalledApplication>);

#[async_trait]
impl Scanner for StaticScanner {
    async fn scan(&self) -> Result<Vec<InstalledApplication>, UpdateError> {
        Ok(dedup_inventory(self.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Provenance;

    #[test]
    fn test_first_seen_wins() {
        let apps = vec![
            InstalledApplication::new("com.a", "A", "1.0", "/Applications/A.app"),
            InstalledApplication::new("com.b", "B", "1.0", "/Applications/B.app"),
            InstalledApplication::new("com.a", "A copy", "0.9", "/Users/me/A.app"),
        ];
        let deduped = dedup_inventory(apps);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].name, "A");
        assert_eq!(deduped[0].version, "1.0");
    }

    #[test]
    fn test_parse_both_document_shapes() {
        let list = r#"[{"identifier":"com.a","name":"A","version":"1.0","path":"/Applications/A.app"}]"#;
        let wrapped = r#"{"applications":[
            {"identifier":"com.b","name":"B","version":"2.0","path":"/Applications/B.app",
             "package_name":"b","provenance":"package_manager"}
        ]}"#;

        let a = parse_inventory(list).unwrap();
        assert_eq!(a[0].provenance, Provenance::Direct);

        let b = parse_inventory(wrapped).unwrap();
        assert!(b[0].is_package_managed());
        assert_eq!(b[0].package_name.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_json_scanner_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(
            &path,
            r#"[{"identifier":"com.a","name":"A","version":"1.0","path":"/A.app"},
                {"identifier":"com.a","name":"A2","version":"1.1","path":"/B.app"}]"#,
        )
        .unwrap();

        let apps = JsonInventoryScanner::new(&path).scan().await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "A");
    }

    #[tokio::test]
    async fn test_missing_inventory_is_an_error() {
        let err = JsonInventoryScanner::new("/nonexistent/inventory.json").scan().await;
        assert!(matches!(err, Err(UpdateError::IoError(_))));
    }
}
