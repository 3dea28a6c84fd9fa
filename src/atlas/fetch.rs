//! # Grid Download and Caching
//!
//! Atlas documents are addressed by deterministic URL templates and fetched
//! through the [`GridFetcher`] trait so sources can be tested without a
//! network.
//!
//! ## URL Templates
//! | Placeholder | Expansion                                   |
//! |-------------|---------------------------------------------|
//! | `{model}`   | Model name from configuration               |
//! | `{date}`    | `YYYYMMDD` of the forecast day              |
//! | `{month}`   | `MM` of the climatology month               |
//! | `{season}`  | `13`..`16` (Jan–Mar, Apr–Jun, Jul–Sep, Oct–Dec) |
//!
//! ## Caching Strategy
//! [`CachingFetcher`] keeps each downloaded document as a file named after
//! its URL. A file younger than the TTL (judged by modification time) is
//! served without touching the network. Cache write failures are ignored.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{Datelike, NaiveDate};
use tracing::debug;

use super::AtlasError;

/// Byte-level access to atlas documents.
pub trait GridFetcher: Send + Sync {
    /// True if a document exists at `url`.
    fn probe(&self, url: &str) -> Result<bool, AtlasError>;

    /// Download the document at `url`.
    fn get(&self, url: &str) -> Result<Vec<u8>, AtlasError>;
}

/// Climatology season code for a month (1–12).
pub fn season_code(month: u32) -> u32 {
    13 + (month.clamp(1, 12) - 1) / 3
}

/// Expand a URL template for `model` and `date`.
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use svp_lib::atlas::fetch::expand_template;
///
/// let date = NaiveDate::from_ymd_opt(2024, 6, 16).unwrap();
/// let url = expand_template("https://host/{model}/{date}_{month}_{season}.json", "rtofs", date);
/// assert_eq!(url, "https://host/rtofs/20240616_06_14.json");
/// ```
pub fn expand_template(template: &str, model: &str, date: NaiveDate) -> String {
    template
        .replace("{model}", model)
        .replace("{date}", &date.format("%Y%m%d").to_string())
        .replace("{month}", &format!("{:02}", date.month()))
        .replace("{season}", &season_code(date.month()).to_string())
}

/// HTTP(S) fetcher on a blocking reqwest client: a `HEAD` probe, then `GET`.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, AtlasError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl GridFetcher for HttpFetcher {
    fn probe(&self, url: &str) -> Result<bool, AtlasError> {
        let response = self.client.head(url).send()?;
        debug!(url, status = %response.status(), "probed grid");
        Ok(response.status().is_success())
    }

    fn get(&self, url: &str) -> Result<Vec<u8>, AtlasError> {
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(AtlasError::NotFound(format!("HTTP {} from {url}", response.status())));
        }
        Ok(response.bytes()?.to_vec())
    }
}

/// Serves `file://` URLs and plain paths from disk. Relative paths resolve
/// against `root`.
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, url: &str) -> PathBuf {
        let raw = url.strip_prefix("file://").unwrap_or(url);
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl GridFetcher for DirectoryFetcher {
    fn probe(&self, url: &str) -> Result<bool, AtlasError> {
        Ok(self.path(url).is_file())
    }

    fn get(&self, url: &str) -> Result<Vec<u8>, AtlasError> {
        let path = self.path(url);
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AtlasError::NotFound(path.display().to_string()),
            _ => AtlasError::Io(e),
        })
    }
}

/// Routes `http(s)://` URLs to HTTP and everything else to disk.
pub struct SchemeFetcher {
    http: HttpFetcher,
    files: DirectoryFetcher,
}

impl SchemeFetcher {
    pub fn new(http: HttpFetcher, files: DirectoryFetcher) -> Self {
        Self { http, files }
    }

    fn route(&self, url: &str) -> &dyn GridFetcher {
        if url.starts_with("http://") || url.starts_with("https://") {
            &self.http
        } else {
            &self.files
        }
    }
}

impl GridFetcher for SchemeFetcher {
    fn probe(&self, url: &str) -> Result<bool, AtlasError> {
        self.route(url).probe(url)
    }

    fn get(&self, url: &str) -> Result<Vec<u8>, AtlasError> {
        self.route(url).get(url)
    }
}

/// Disk cache in front of another fetcher.
pub struct CachingFetcher {
    inner: Arc<dyn GridFetcher>,
    dir: PathBuf,
    ttl: Duration,
}

impl CachingFetcher {
    pub fn new(inner: Arc<dyn GridFetcher>, dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            inner,
            dir: dir.into(),
            ttl,
        }
    }

    /// Cache file for `url`: every character outside `[A-Za-z0-9.-]` becomes
    /// `_`.
    fn cache_path(&self, url: &str) -> PathBuf {
        let name: String = url
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(name)
    }

    fn load_cache(&self, url: &str) -> Result<Vec<u8>, io::Error> {
        let path = self.cache_path(url);
        let meta = fs::metadata(&path)?;
        let age = SystemTime::now()
            .duration_since(meta.modified()?)
            .map_err(|_| io::Error::other("time error"))?;
        if age > self.ttl {
            return Err(io::Error::other("stale"));
        }
        fs::read(path)
    }

    fn save_cache(&self, url: &str, bytes: &[u8]) -> Result<(), io::Error> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.cache_path(url), bytes)
    }
}

impl GridFetcher for CachingFetcher {
    fn probe(&self, url: &str) -> Result<bool, AtlasError> {
        if self.load_cache(url).is_ok() {
            return Ok(true);
        }
        self.inner.probe(url)
    }

    fn get(&self, url: &str) -> Result<Vec<u8>, AtlasError> {
        if let Ok(bytes) = self.load_cache(url) {
            debug!(url, "grid cache hit");
            return Ok(bytes);
        }
        let bytes = self.inner.get(url)?;
        if let Err(e) = self.save_cache(url, &bytes) {
            debug!(url, error = %e, "grid cache write failed");
        }
        Ok(bytes)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// In-memory documents keyed by URL, recording every download.
    #[derive(Default)]
    pub(crate) struct MapFetcher {
        pub documents: Mutex<HashMap<String, Vec<u8>>>,
        pub downloads: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        pub(crate) fn insert(&self, url: &str, grid: &crate::atlas::Grid) {
            let bytes = serde_json::to_vec(grid).unwrap();
            self.documents.lock().insert(url.to_string(), bytes);
        }
    }

    impl GridFetcher for MapFetcher {
        fn probe(&self, url: &str) -> Result<bool, AtlasError> {
            Ok(self.documents.lock().contains_key(url))
        }

        fn get(&self, url: &str) -> Result<Vec<u8>, AtlasError> {
            self.downloads.lock().push(url.to_string());
            self.documents
                .lock()
                .get(url)
                .cloned()
                .ok_or_else(|| AtlasError::NotFound(url.to_string()))
        }
    }

    /// Counts calls and serves a fixed body.
    struct CountingFetcher {
        gets: Mutex<usize>,
    }

    impl GridFetcher for CountingFetcher {
        fn probe(&self, _url: &str) -> Result<bool, AtlasError> {
            Ok(false)
        }

        fn get(&self, _url: &str) -> Result<Vec<u8>, AtlasError> {
            *self.gets.lock() += 1;
            Ok(b"{}".to_vec())
        }
    }

    #[test]
    fn test_season_codes() {
        assert_eq!(season_code(1), 13);
        assert_eq!(season_code(3), 13);
        assert_eq!(season_code(4), 14);
        assert_eq!(season_code(9), 15);
        assert_eq!(season_code(12), 16);
    }

    #[test]
    fn test_directory_fetcher_resolves_relative_and_file_urls() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("grid.json"), b"data").unwrap();
        let fetcher = DirectoryFetcher::new(dir.path());

        assert!(fetcher.probe("grid.json").unwrap());
        assert_eq!(fetcher.get("grid.json").unwrap(), b"data");

        let absolute = format!("file://{}", dir.path().join("grid.json").display());
        assert!(fetcher.probe(&absolute).unwrap());
        assert!(!fetcher.probe("missing.json").unwrap());
        assert!(matches!(fetcher.get("missing.json"), Err(AtlasError::NotFound(_))));
    }

    #[test]
    fn test_caching_fetcher_serves_fresh_copy() {
        let dir = TempDir::new().unwrap();
        let inner = Arc::new(CountingFetcher { gets: Mutex::new(0) });
        let cache = CachingFetcher::new(inner.clone(), dir.path(), Duration::from_secs(600));

        let url = "https://host/grid_20240616.json";
        assert_eq!(cache.get(url).unwrap(), b"{}");
        assert_eq!(cache.get(url).unwrap(), b"{}");
        assert_eq!(*inner.gets.lock(), 1);
        assert!(cache.probe(url).unwrap());
    }

    #[test]
    fn test_caching_fetcher_refetches_stale_copy() {
        let dir = TempDir::new().unwrap();
        let inner = Arc::new(CountingFetcher { gets: Mutex::new(0) });
        let cache = CachingFetcher::new(inner.clone(), dir.path(), Duration::ZERO);

        let url = "https://host/grid.json";
        cache.get(url).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        cache.get(url).unwrap();
        assert_eq!(*inner.gets.lock(), 2);
    }
}
