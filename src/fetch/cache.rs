//! On-disk response cache.
//!
//! One JSON file per request, named by the SHA-256 of URL + options.
//! Entries older than the freshness window are treated as misses.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::transport::{FetchOptions, FetchResponse};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedResponse {
    url: String,
    status: u16,
    body: String,
    fetched_at: String,
}

pub struct ResponseCache {
    dir: PathBuf,
    max_age: chrono::Duration,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, max_age: chrono::Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    /// Default cache location (~/.worldsync/cache).
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".worldsync")
            .join("cache")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key(url: &str, options: &FetchOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        hasher.update(serde_json::to_vec(options).unwrap_or_default());
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, url: &str, options: &FetchOptions) -> PathBuf {
        self.dir.join(format!("{}.json", Self::key(url, options)))
    }

    /// Return a fresh cached response, or None on miss, staleness or a
    /// corrupt entry.
    pub async fn get(&self, url: &str, options: &FetchOptions) -> Option<FetchResponse> {
        let path = self.path_for(url, options);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        let cached: CachedResponse = match serde_json::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                log::debug!("Cache: ignoring corrupt entry {}: {}", path.display(), e);
                return None;
            }
        };

        if is_stale(&cached.fetched_at, self.max_age) {
            return None;
        }

        Some(FetchResponse {
            url: cached.url,
            status: cached.status,
            body: cached.body,
        })
    }

    pub async fn put(
        &self,
        url: &str,
        options: &FetchOptions,
        response: &FetchResponse,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let cached = CachedResponse {
            url: response.url.clone(),
            status: response.status,
            body: response.body.clone(),
            fetched_at: Utc::now().to_rfc3339(),
        };
        let content = serde_json::to_string(&cached)?;
        tokio::fs::write(self.path_for(url, options), content).await
    }
}

/// Whether a response is worth caching. Backpressure and server errors
/// are transient and must be fetched again next time.
pub fn is_cacheable(response: &FetchResponse) -> bool {
    response.status != 429 && response.status < 500
}

/// Check if an entry fetched at `fetched_at` is older than `max_age`.
/// Unparseable timestamps count as stale.
pub fn is_stale(fetched_at: &str, max_age: chrono::Duration) -> bool {
    DateTime::parse_from_rfc3339(fetched_at)
        .map(|dt| Utc::now() - dt.with_timezone(&Utc) >= max_age)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn response(status: u16, body: &str) -> FetchResponse {
        FetchResponse {
            url: "https://wiki.example/".to_string(),
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_key_depends_on_options() {
        let url = "https://wiki.example/w/api.php";
        let get = FetchOptions::get();
        let post = FetchOptions::post_form(vec![("action".into(), "query".into())]);
        assert_ne!(ResponseCache::key(url, &get), ResponseCache::key(url, &post));
        assert_eq!(ResponseCache::key(url, &get), ResponseCache::key(url, &FetchOptions::get()));
    }

    #[test]
    fn test_is_stale() {
        let fresh = Utc::now().to_rfc3339();
        let old = (Utc::now() - chrono::Duration::hours(30)).to_rfc3339();
        assert!(!is_stale(&fresh, chrono::Duration::hours(24)));
        assert!(is_stale(&old, chrono::Duration::hours(24)));
        assert!(is_stale("not a date", chrono::Duration::hours(24)));
    }

    #[test]
    fn test_is_cacheable() {
        assert!(is_cacheable(&response(200, "")));
        assert!(is_cacheable(&response(404, "")));
        assert!(!is_cacheable(&response(429, "")));
        assert!(!is_cacheable(&response(503, "")));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::new(temp.path().join("cache"), chrono::Duration::hours(1));
        let options = FetchOptions::get();

        assert!(cache.get("https://wiki.example/", &options).await.is_none());

        cache
            .put("https://wiki.example/", &options, &response(200, "hello"))
            .await
            .unwrap();

        let hit = cache.get("https://wiki.example/", &options).await.unwrap();
        assert_eq!(hit.body, "hello");
        assert_eq!(hit.status, 200);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::new(temp.path(), chrono::Duration::zero());
        let options = FetchOptions::get();

        cache
            .put("https://wiki.example/", &options, &response(200, "hello"))
            .await
            .unwrap();

        assert!(cache.get("https://wiki.example/", &options).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::new(temp.path(), chrono::Duration::hours(1));
        let options = FetchOptions::get();
        let path = temp
            .path()
            .join(format!("{}.json", ResponseCache::key("https://wiki.example/", &options)));
        tokio::fs::write(&path, "{not json").await.unwrap();

        assert!(cache.get("https://wiki.example/", &options).await.is_none());
    }
}
