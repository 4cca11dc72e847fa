use std::{
    fs,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid locator: {0}")]
    InvalidLocator(String),
    #[error("unsupported locator scheme {0}")]
    UnsupportedScheme(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Performs the actual work behind a fetch request.
///
/// Implementations are synchronous and run on the blocking pool, so they may
/// block on I/O freely. On success they return the locator of the fetched copy.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self, locator: &str) -> Result<String, FetchError>;
}

impl<F> Fetcher for F
where
    F: Fn(&str) -> Result<String, FetchError> + Send + Sync + 'static,
{
    fn fetch(&self, locator: &str) -> Result<String, FetchError> {
        self(locator)
    }
}

/// Copies `file://` resources into a local cache directory.
#[derive(Debug, Clone)]
pub struct CacheFetcher {
    cache_dir: PathBuf,
}

impl CacheFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl Fetcher for CacheFetcher {
    fn fetch(&self, locator: &str) -> Result<String, FetchError> {
        let url = Url::parse(locator).map_err(|err| FetchError::InvalidLocator(err.to_string()))?;
        if url.scheme() != "file" {
            return Err(FetchError::UnsupportedScheme(url.scheme().to_owned()));
        }

        let source = url
            .to_file_path()
            .map_err(|_| FetchError::InvalidLocator(format!("not a local path: {locator}")))?;

        fs::create_dir_all(&self.cache_dir)?;
        let target = self.cache_dir.join(cache_file_name(locator, &source));
        fs::copy(&source, &target)?;

        let target = target.canonicalize()?;
        Url::from_file_path(&target)
            .map(|url| url.to_string())
            .map_err(|_| FetchError::InvalidLocator(target.display().to_string()))
    }
}

/// Cache entries are keyed by the locator so refetching overwrites in place.
fn cache_file_name(locator: &str, source: &Path) -> String {
    let digest = hex::encode(Sha256::digest(locator.as_bytes()));
    match source.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("{digest}.{ext}"),
        None => digest,
    }
}
