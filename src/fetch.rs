//! Shared HTTP client and file archive for site types.
//!
//! One [`HttpFetcher`] is shared by every site type of a process so the
//! request throttle applies across all of them. Failures map to
//! [`SiteError::Fetch`] and are retried by the sync engine.
//!
//! Files referenced by entities (images, attachments) can be saved to a
//! content-addressed [`FileArchive`]. The stored field then carries a
//! [`FileRef`]: the locator, plus the archived file name once saved.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::FetchConfig;
use crate::error::SiteError;
use crate::site::FetchTarget;

pub struct HttpFetcher {
    client: reqwest::Client,
    min_interval_ms: u64,
    jitter_ms: u64,
    last_request: Mutex<Option<Instant>>,
    archive: Option<FileArchive>,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to create HTTP client")?;

        let archive = config
            .archive_dir
            .as_ref()
            .map(|dir| FileArchive::new(dir.clone(), config.archive_defer));

        Ok(Self {
            client,
            min_interval_ms: config.min_interval_ms,
            jitter_ms: config.min_interval_jitter_ms,
            last_request: Mutex::new(None),
            archive,
        })
    }

    pub fn archive(&self) -> Option<&FileArchive> {
        self.archive.as_ref()
    }

    /// Delay before the next request: the minimum interval moved by a random
    /// offset of at most the jitter either way.
    fn next_interval(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::from_millis(self.min_interval_ms);
        }
        let jitter = self.jitter_ms as i64;
        let offset = fastrand::i64(-jitter..=jitter);
        Duration::from_millis((self.min_interval_ms as i64 + offset).max(0) as u64)
    }

    /// Wait until the throttle interval has passed since the previous
    /// request was issued.
    async fn throttle(&self) {
        if self.min_interval_ms == 0 && self.jitter_ms == 0 {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.next_interval();
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn send(&self, target: &FetchTarget, url: &str) -> Result<reqwest::Response, SiteError> {
        self.throttle().await;
        tracing::debug!(fetch = %target, url, "GET");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SiteError::fetch(target, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SiteError::fetch(target, format!("HTTP {} for {}", status, url)));
        }
        Ok(response)
    }

    /// GET `url` and return the body as text.
    pub async fn get_text(&self, target: &FetchTarget, url: &str) -> Result<String, SiteError> {
        self.send(target, url)
            .await?
            .text()
            .await
            .map_err(|e| SiteError::fetch(target, format!("failed to read body: {}", e)))
    }

    /// GET `url` and return the raw body.
    pub async fn get_bytes(&self, target: &FetchTarget, url: &str) -> Result<Vec<u8>, SiteError> {
        let body = self
            .send(target, url)
            .await?
            .bytes()
            .await
            .map_err(|e| SiteError::fetch(target, format!("failed to read body: {}", e)))?;
        Ok(body.to_vec())
    }
}

/// Content-addressed directory of downloaded files.
pub struct FileArchive {
    dir: PathBuf,
    defer: bool,
}

impl FileArchive {
    pub fn new(dir: impl Into<PathBuf>, defer: bool) -> Self {
        Self {
            dir: dir.into(),
            defer,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// When set, syncs record file locators only.
    pub fn defer(&self) -> bool {
        self.defer
    }

    /// Save `data` as `<sha256>.<ext>` and return that file name. Saving
    /// identical content again reuses the existing file.
    pub async fn save(
        &self,
        target: &FetchTarget,
        data: &[u8],
        ext: &str,
    ) -> Result<String, SiteError> {
        let name = format!("{}.{}", hex::encode(Sha256::digest(data)), ext);
        let path = self.dir.join(&name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(name);
        }

        let io_err = |e: std::io::Error| SiteError::fetch(target, format!("{}: {}", path.display(), e));
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let partial = self.dir.join(format!("{}.part", name));
        tokio::fs::write(&partial, data).await.map_err(io_err)?;
        tokio::fs::rename(&partial, &path).await.map_err(io_err)?;
        tracing::debug!(fetch = %target, file = %name, bytes = data.len(), "archived file");
        Ok(name)
    }
}

/// Extension for an archived file, taken from its locator. `bin` when the
/// locator has none.
pub fn file_extension(locator: &str) -> String {
    let path = locator.split(['?', '#']).next().unwrap_or(locator);
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}

/// Stored form of a file field: `<locator>` while deferred, then
/// `<locator>\t<archived name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub locator: String,
    pub archived: Option<String>,
}

impl FileRef {
    pub fn parse(stored: &str) -> Self {
        match stored.rsplit_once('\t') {
            Some((locator, name)) => Self {
                locator: locator.to_string(),
                archived: Some(name.to_string()),
            },
            None => Self {
                locator: stored.to_string(),
                archived: None,
            },
        }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.archived {
            Some(name) => write!(f, "{}\t{}", self.locator, name),
            None => f.write_str(&self.locator),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn throttle_spaces_requests() {
        let config = FetchConfig {
            min_interval_ms: 40,
            ..FetchConfig::default()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();
        let start = Instant::now();
        fetcher.throttle().await;
        fetcher.throttle().await;
        fetcher.throttle().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = FetchConfig {
            min_interval_ms: 40,
            min_interval_jitter_ms: 20,
            ..FetchConfig::default()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();
        let intervals: Vec<Duration> = (0..200).map(|_| fetcher.next_interval()).collect();
        assert!(intervals
            .iter()
            .all(|d| *d >= Duration::from_millis(20) && *d <= Duration::from_millis(60)));
        assert!(intervals.iter().any(|d| *d != intervals[0]));
    }

    #[tokio::test]
    async fn unreachable_host_is_a_fetch_error() {
        let config = FetchConfig {
            timeout_secs: 2,
            ..FetchConfig::default()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();
        let target = FetchTarget::new("page", "x");
        let err = fetcher
            .get_text(&target, "http://127.0.0.1:9/nothing")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn archive_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FileArchive::new(dir.path().join("files"), false);
        let target = FetchTarget::new("photo", "p/1.json");

        let a = archive.save(&target, b"\x89PNG one", "png").await.unwrap();
        let again = archive.save(&target, b"\x89PNG one", "png").await.unwrap();
        let b = archive.save(&target, b"\x89PNG two", "png").await.unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert!(a.ends_with(".png"));
        assert_eq!(
            std::fs::read(archive.dir().join(&a)).unwrap(),
            b"\x89PNG one".to_vec()
        );
        assert_eq!(std::fs::read_dir(archive.dir()).unwrap().count(), 2);
    }

    #[test]
    fn file_refs_and_extensions() {
        assert_eq!(file_extension("img/photo.JPG"), "jpg");
        assert_eq!(file_extension("https://x.test/a.png?size=2"), "png");
        assert_eq!(file_extension("download"), "bin");

        let saved = FileRef {
            locator: "img/a b.png".into(),
            archived: Some("ab12.png".into()),
        };
        assert_eq!(FileRef::parse(&saved.to_string()), saved);
        assert_eq!(FileRef::parse("img/a.png").archived, None);
    }
}
