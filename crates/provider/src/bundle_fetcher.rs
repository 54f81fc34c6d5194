use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::debug;

/// Fetches a content-addressed deployment bundle (a compose file) to disk.
#[async_trait]
pub trait BundleFetcher: Send + Sync {
    /// Download `cid` into `out_dir` and return the written file's path.
    async fn fetch(&self, cid: &str, out_dir: &Path) -> Result<PathBuf>;
}

/// Fetcher backed by an IPFS node's HTTP API.
pub struct IpfsFetcher {
    base: String,
    client: Client,
    /// Last successfully fetched content id; refetching it is skipped while
    /// the file is still on disk.
    last_cid: Mutex<Option<String>>,
}

impl IpfsFetcher {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(IpfsFetcher {
            base: base.into().trim_end_matches('/').to_string(),
            client,
            last_cid: Mutex::new(None),
        })
    }
}

#[async_trait]
impl BundleFetcher for IpfsFetcher {
    async fn fetch(&self, cid: &str, out_dir: &Path) -> Result<PathBuf> {
        if cid.is_empty() || cid.contains('/') || cid.contains("..") {
            return Err(anyhow::anyhow!("invalid content id {:?}", cid));
        }
        let path = out_dir.join(cid);
        if self.last_cid.lock().as_deref() == Some(cid) && path.exists() {
            return Ok(path);
        }

        tokio::fs::create_dir_all(out_dir).await?;

        let url = format!("{}/api/v0/cat", self.base);
        let resp = self.client.post(&url).query(&[("arg", cid)]).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let t = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("ipfs cat {} failed {} {}", cid, status, t));
        }
        let body = resp.bytes().await?;
        tokio::fs::write(&path, &body).await?;

        debug!(cid, path = %path.display(), bytes = body.len(), "bundle fetched");
        *self.last_cid.lock() = Some(cid.to_string());
        Ok(path)
    }
}
