//! HTTP access for feeds, release APIs and artifact downloads.
//!
//! Small documents (appcasts, release listings, rule lists) are fetched into
//! memory. Artifacts are streamed to disk with progress reporting under the
//! longer download timeout. Both are capped in size; the cap is checked
//! against `Content-Length` up front and against the bytes actually read.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::error::UpdateError;

/// Progress callback type for download progress reporting.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Shared HTTP client.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    download_timeout: Duration,
    max_document_bytes: u64,
    max_download_bytes: u64,
    progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("download_timeout", &self.download_timeout)
            .field("max_document_bytes", &self.max_document_bytes)
            .field("max_download_bytes", &self.max_download_bytes)
            .field("has_progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Downloader {
    /// Build a client from network settings.
    pub fn new(config: &NetworkConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .timeout(config.timeout())
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            client,
            download_timeout: Duration::from_secs(config.download_timeout_seconds),
            max_document_bytes: config.max_document_bytes,
            max_download_bytes: config.max_download_bytes,
            progress_callback: None,
        })
    }

    /// Override the document and artifact size caps.
    pub fn with_limits(mut self, max_document_bytes: u64, max_download_bytes: u64) -> Self {
        self.max_document_bytes = max_document_bytes;
        self.max_download_bytes = max_download_bytes;
        self
    }

    /// Set the progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(DownloadProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Fetch a small document into memory.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, UpdateError> {
        self.fetch_with_token(url, None).await
    }

    /// Fetch a small document, sending `token` as a bearer credential.
    pub async fn fetch_with_token(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<Vec<u8>, UpdateError> {
        debug!(url, "Fetching");

        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(UpdateError::DownloadFailed {
                status: response.status().as_u16(),
            });
        }

        let limit = self.max_document_bytes;
        check_limit(response.content_length().unwrap_or(0), limit)?;

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            check_limit((body.len() + chunk.len()) as u64, limit)?;
            body.extend_from_slice(&chunk);
        }
        debug!(url, bytes = body.len(), "Fetched");
        Ok(body)
    }

    /// Stream `url` into `dir`, returning the written file path.
    pub async fn download_to_dir(&self, url: &str, dir: &Path) -> Result<PathBuf, UpdateError> {
        let dest = dir.join(file_name_from_url(url));
        self.download_to(url, &dest).await?;
        Ok(dest)
    }

    /// Stream `url` into `dest`. `file://` URLs are copied from local
    /// storage (mirrors, removable media).
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, UpdateError> {
        if let Some(local) = url.strip_prefix("file://") {
            return self.import_local(Path::new(local), dest).await;
        }
        info!(url, dest = %dest.display(), "Starting download");

        let response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::DownloadFailed {
                status: status.as_u16(),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let total = response.content_length();
        check_limit(total.unwrap_or(0), self.max_download_bytes)?;

        let mut file = tokio::fs::File::create(dest).await?;
        let written = self.stream_to(response, &mut file, total).await;
        drop(file);

        match written {
            Ok(downloaded) => {
                info!(url, bytes = downloaded, "Download complete");
                Ok(downloaded)
            }
            Err(e) => {
                if let Err(remove) = tokio::fs::remove_file(dest).await {
                    debug!(dest = %dest.display(), error = %remove, "Could not remove partial download");
                }
                Err(e)
            }
        }
    }

    async fn stream_to(
        &self,
        response: reqwest::Response,
        file: &mut tokio::fs::File,
        total: Option<u64>,
    ) -> Result<u64, UpdateError> {
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        self.report_progress(downloaded, total);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            downloaded += chunk.len() as u64;
            check_limit(downloaded, self.max_download_bytes)?;
            file.write_all(&chunk).await?;
            self.report_progress(downloaded, total);
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(downloaded)
    }

    async fn import_local(&self, source: &Path, dest: &Path) -> Result<u64, UpdateError> {
        info!(source = %source.display(), dest = %dest.display(), "Importing local artifact");
        let total = tokio::fs::metadata(source).await?.len();
        check_limit(total, self.max_download_bytes)?;
        self.report_progress(0, Some(total));

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let copied = tokio::fs::copy(source, dest).await?;
        self.report_progress(copied, Some(total));
        Ok(copied)
    }

    fn report_progress(&self, downloaded: u64, total: Option<u64>) {
        if let Some(callback) = &self.progress_callback {
            callback(DownloadProgress { downloaded, total });
        }
    }
}

fn check_limit(size: u64, limit: u64) -> Result<(), UpdateError> {
    if size > limit {
        return Err(UpdateError::ResponseTooLarge { limit });
    }
    Ok(())
}

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    /// Content length, when the server sent one
    pub total: Option<u64>,
}

impl DownloadProgress {
    /// Completion percentage, if the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.downloaded as f64 / total as f64) * 100.0),
            None => None,
        }
    }
}

/// Last path segment of `url` with query and fragment removed, reduced to
/// `[A-Za-z0-9._-]`.
///
/// The name ends up as an argument to `tar`, `hdiutil` and `installer`, so
/// it must survive [`crate::executor::SafeExecutor`] argument sanitizing
/// unchanged and never read as an option. Falls back to `download` when the
/// URL has no usable segment.
pub fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);

    let segment = after_scheme
        .split_once('/')
        .map(|(_, path)| path.rsplit('/').next().unwrap_or(""))
        .unwrap_or("");

    let name: String = segment
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();

    if name.trim_matches(['.', '_']).is_empty() {
        "download".to_string()
    } else if name.starts_with(['.', '-']) {
        format!("download{name}")
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("https://example.com/dl/App-1.2.dmg"), "App-1.2.dmg");
        assert_eq!(file_name_from_url("https://example.com/a.zip?token=x#frag"), "a.zip");
        assert_eq!(file_name_from_url("https://example.com/"), "download");
        assert_eq!(file_name_from_url("https://example.com"), "download");
        assert_eq!(file_name_from_url("https://example.com/x/.."), "download");
    }

    #[test]
    fn test_file_name_survives_argument_sanitizing() {
        assert_eq!(file_name_from_url("https://e.com/Editor;2.0.tar"), "Editor_2.0.tar");
        assert_eq!(file_name_from_url("https://e.com/My%20App$(x)|y.dmg"), "My_20App__x__y.dmg");
        assert_eq!(file_name_from_url("https://e.com/a<b>c\\d.zip"), "a_b_c_d.zip");
        assert_eq!(file_name_from_url("https://e.com/-rf.pkg"), "download-rf.pkg");
        assert_eq!(file_name_from_url("https://e.com/.hidden.zip"), "download.hidden.zip");
        assert_eq!(file_name_from_url("https://e.com/;;;"), "download");

        let name = file_name_from_url("https://e.com/Editor;2.0.tar");
        let args = vec![name.clone()];
        assert_eq!(crate::executor::sanitize_args(&args).unwrap(), args);
    }

    #[test]
    fn test_progress_percentage() {
        let half = DownloadProgress { downloaded: 50, total: Some(100) };
        assert_eq!(half.percentage(), Some(50.0));
        let unknown = DownloadProgress { downloaded: 50, total: None };
        assert_eq!(unknown.percentage(), None);
    }

    #[test]
    fn test_downloader_builds_from_default_config() {
        let downloader = Downloader::new(&NetworkConfig::default()).unwrap();
        assert_eq!(downloader.download_timeout, Duration::from_secs(600));
    }

    /// Serve one canned HTTP response on loopback and return its base URL.
    async fn serve_once(response: Vec<u8>) -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            // The client may hang up early once it hits its limit.
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}")
    }

    fn sized_response(body: &[u8]) -> Vec<u8> {
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let mut response = head.into_bytes();
        response.extend_from_slice(body);
        response
    }

    /// No Content-Length: the body is read to EOF.
    fn unsized_response(body: &[u8]) -> Vec<u8> {
        let mut response = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(body);
        response
    }

    fn limited(document: u64, download: u64) -> Downloader {
        Downloader::new(&NetworkConfig::default()).unwrap().with_limits(document, download)
    }

    #[tokio::test]
    async fn test_fetch_within_limit() {
        let url = serve_once(sized_response(b"<rss/>")).await;
        assert_eq!(limited(6, 6).fetch(&url).await.unwrap(), b"<rss/>");
    }

    #[tokio::test]
    async fn test_fetch_rejects_declared_length_over_limit() {
        let url = serve_once(sized_response(&[b'x'; 64])).await;
        let err = limited(16, 1024).fetch(&url).await.unwrap_err();
        assert!(matches!(err, UpdateError::ResponseTooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn test_fetch_rejects_streamed_body_over_limit() {
        let url = serve_once(unsized_response(&[b'x'; 64])).await;
        let err = limited(16, 1024).fetch(&url).await.unwrap_err();
        assert!(matches!(err, UpdateError::ResponseTooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn test_download_over_limit_leaves_no_partial_file() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("App.zip");

        let url = serve_once(unsized_response(&[b'z'; 4096])).await;
        let err = limited(16, 1024).download_to(&url, &dest).await.unwrap_err();
        assert!(matches!(err, UpdateError::ResponseTooLarge { limit: 1024 }));
        assert!(!dest.exists());

        let url = serve_once(sized_response(&[b'z'; 4096])).await;
        let err = limited(16, 1024).download_to(&url, &dest).await.unwrap_err();
        assert!(matches!(err, UpdateError::ResponseTooLarge { limit: 1024 }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_local_import_over_limit_is_refused() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("Big.dmg");
        std::fs::write(&source, [0u8; 128]).unwrap();
        let dest = temp.path().join("out/Big.dmg");

        let err = limited(16, 64)
            .download_to(&format!("file://{}", source.display()), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::ResponseTooLarge { limit: 64 }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_file_url_is_imported_with_progress() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("App-2.0.zip");
        std::fs::write(&source, b"archive bytes").unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let downloader = Downloader::new(&NetworkConfig::default())
            .unwrap()
            .with_progress(move |p| sink.lock().unwrap().push(p));

        let url = format!("file://{}", source.display());
        let out = downloader.download_to_dir(&url, &temp.path().join("out")).await.unwrap();

        assert_eq!(out.file_name().unwrap(), "App-2.0.zip");
        assert_eq!(std::fs::read(&out).unwrap(), b"archive bytes");
        let last = *seen.lock().unwrap().last().unwrap();
        assert_eq!(last, DownloadProgress { downloaded: 13, total: Some(13) });
    }
}
