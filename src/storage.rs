//! Storage collaborators the pipeline calls
//!
//! Object storage, URL signing and domain rewriting are supplied at
//! construction so the pipeline can run against anything from a local
//! directory to a production object store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use url::Url;

use crate::config::ImageFormat;
use crate::error::ScreenshotError;

/// Uploads capture artifacts, returning an opaque storage key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, filepath: &Path) -> Result<String, ScreenshotError>;
}

/// Produces a signed image-transform URL for a stored artifact.
#[cfg_attr(test, mockall::automock)]
pub trait UrlSigner: Send + Sync {
    fn sign(
        &self,
        storage_key: &str,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Result<String, ScreenshotError>;
}

/// Rewrites URLs for internal hosts; identity for everything else.
pub trait UrlRewriter: Send + Sync {
    fn transform(&self, url: &str) -> String;

    /// Undo `transform` so cache keys stay canonical.
    fn reverse(&self, url: &str) -> String {
        url.to_string()
    }
}

/// Stores artifacts under a local directory. The storage key is the
/// file name.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, filepath: &Path) -> Result<String, ScreenshotError> {
        let name = filepath
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ScreenshotError::Upload(format!("artifact has no file name: {}", filepath.display()))
            })?
            .to_string();

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ScreenshotError::Upload(format!("create store dir: {e}")))?;

        let dest = self.root.join(&name);
        tokio::fs::copy(filepath, &dest)
            .await
            .map_err(|e| ScreenshotError::Upload(format!("copy artifact: {e}")))?;

        Ok(name)
    }
}

/// Image-proxy style signer: the path is digested with a shared secret
/// and embedded in the URL.
pub struct ProxyUrlSigner {
    base_url: String,
    secret: String,
}

impl ProxyUrlSigner {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            secret: secret.into(),
        }
    }
}

impl UrlSigner for ProxyUrlSigner {
    fn sign(
        &self,
        storage_key: &str,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Result<String, ScreenshotError> {
        let path = format!("/rs:fit:{width}:{height}/{storage_key}@{}", format.extension());
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(path.as_bytes());
        let signature = hex::encode(&hasher.finalize()[..16]);
        Ok(format!("{}/{}{}", self.base_url.trim_end_matches('/'), signature, path))
    }
}

/// Domain rewriting rule: requests for `from_domain` are served from
/// `to_host` over `protocol`.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub from_domain: String,
    pub to_host: String,
    pub protocol: String,
}

/// Table-driven rewriter with exact reverse mapping.
pub struct MappingUrlRewriter {
    rules: HashMap<String, RewriteRule>,
    reverse_rules: HashMap<String, RewriteRule>,
}

impl MappingUrlRewriter {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        let mut forward = HashMap::new();
        let mut reverse = HashMap::new();
        for rule in rules {
            reverse.insert(rule.to_host.clone(), rule.clone());
            forward.insert(rule.from_domain.clone(), rule);
        }
        Self {
            rules: forward,
            reverse_rules: reverse,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vec::new())
    }

    fn rewrite_with(url: &str, host: &str, protocol: &str) -> Option<String> {
        let mut parsed = Url::parse(url).ok()?;
        parsed.set_host(Some(host)).ok()?;
        if parsed.set_scheme(protocol).is_err() {
            warn!(url, protocol, "unable to set scheme during rewrite");
        }
        Some(parsed.to_string())
    }
}

impl UrlRewriter for MappingUrlRewriter {
    fn transform(&self, url: &str) -> String {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string))
        else {
            return url.to_string();
        };
        let domain = host.strip_prefix("www.").unwrap_or(&host);

        match self.rules.get(domain) {
            Some(rule) => match Self::rewrite_with(url, &rule.to_host, &rule.protocol) {
                Some(rewritten) => {
                    info!(from = url, to = %rewritten, "url transformed");
                    rewritten
                }
                None => url.to_string(),
            },
            None => url.to_string(),
        }
    }

    fn reverse(&self, url: &str) -> String {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string))
        else {
            return url.to_string();
        };

        match self.reverse_rules.get(&host) {
            Some(rule) => {
                Self::rewrite_with(url, &rule.from_domain, "https").unwrap_or_else(|| url.to_string())
            }
            None => url.to_string(),
        }
    }
}

/// Convenience bundle handed to the pipeline at construction.
#[derive(Clone)]
pub struct StorageCollaborators {
    pub object_store: Arc<dyn ObjectStore>,
    pub signer: Arc<dyn UrlSigner>,
    pub rewriter: Arc<dyn UrlRewriter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_is_deterministic_and_parameter_sensitive() {
        let signer = ProxyUrlSigner::new("https://img.example", "secret");
        let a = signer.sign("shot.png", 1280, 720, ImageFormat::Png).unwrap();
        let b = signer.sign("shot.png", 1280, 720, ImageFormat::Png).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("https://img.example/"));
        assert!(a.contains("rs:fit:1280:720"));

        let c = signer.sign("shot.png", 640, 480, ImageFormat::Png).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn rewriter_transforms_known_domains_and_reverses() {
        let rewriter = MappingUrlRewriter::new(vec![RewriteRule {
            from_domain: "shop.example".into(),
            to_host: "shop-internal".into(),
            protocol: "http".into(),
        }]);

        let rewritten = rewriter.transform("https://www.shop.example/products?page=2");
        assert_eq!(rewritten, "http://shop-internal/products?page=2");

        let restored = rewriter.reverse(&rewritten);
        assert_eq!(restored, "https://shop.example/products?page=2");
    }

    #[test]
    fn rewriter_is_identity_for_unknown_hosts() {
        let rewriter = MappingUrlRewriter::identity();
        assert_eq!(
            rewriter.transform("https://example.com/a"),
            "https://example.com/a"
        );
        assert_eq!(
            rewriter.reverse("https://example.com/a"),
            "https://example.com/a"
        );
    }

    #[tokio::test]
    async fn local_store_uploads_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        let artifact = dir.path().join("shot.png");
        tokio::fs::write(&artifact, b"png-bytes").await.unwrap();

        let store = LocalObjectStore::new(&store_dir);
        let key = store.upload(&artifact).await.unwrap();
        assert_eq!(key, "shot.png");
        let stored = tokio::fs::read(store_dir.join("shot.png")).await.unwrap();
        assert_eq!(stored, b"png-bytes");
    }
}
