//! Object storage adapters for generated assets.

use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use contentmigrator_shared::{MigratorError, ObjectStore, ObjectStoreConfig, Result, read_secret};

use crate::{build_client, check_status, join_url, transport_error};

/// Build the configured object store.
pub fn from_config(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config {
        ObjectStoreConfig::Local {
            root,
            public_base_url,
        } => Ok(Arc::new(LocalObjectStore::new(root, public_base_url.clone()))),
        ObjectStoreConfig::Http {
            base_url,
            public_base_url,
            token_env,
        } => {
            url::Url::parse(base_url).map_err(|e| {
                MigratorError::validation(format!("invalid object_store base_url '{base_url}': {e}"))
            })?;
            let token = token_env.as_deref().map(read_secret).transpose()?;
            Ok(Arc::new(HttpObjectStore::new(
                base_url.clone(),
                public_base_url.clone(),
                token,
            )?))
        }
    }
}

/// Reject absolute paths and parent traversal.
fn relative_path(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let clean = !path.is_empty()
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !clean {
        return Err(MigratorError::fatal(format!(
            "object path '{path}' must be relative without '..'"
        )));
    }
    Ok(candidate.to_path_buf())
}

// ---------------------------------------------------------------------------
// LocalObjectStore
// ---------------------------------------------------------------------------

/// Files under a local root directory, served from a public base URL.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: String) -> Self {
        Self {
            root: root.into(),
            public_base_url,
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, bytes: Vec<u8>, path: &str) -> Result<String> {
        let target = self.root.join(relative_path(path)?);
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&dir).map_err(|e| MigratorError::io(&dir, e))?;

        // Same-directory temp file so the rename is atomic.
        let mut tmp =
            tempfile::NamedTempFile::new_in(&dir).map_err(|e| MigratorError::io(&dir, e))?;
        let written = tmp.write_all(&bytes).and_then(|()| tmp.as_file().sync_all());
        written.map_err(|e| MigratorError::io(tmp.path(), e))?;
        tmp.persist(&target)
            .map_err(|e| MigratorError::io(&target, e.error))?;

        debug!(path = %target.display(), bytes = bytes.len(), "stored object");
        Ok(join_url(&self.public_base_url, path))
    }
}

// ---------------------------------------------------------------------------
// HttpObjectStore
// ---------------------------------------------------------------------------

/// Objects uploaded with `PUT {base_url}/{path}`.
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    public_base_url: Option<String>,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        base_url: String,
        public_base_url: Option<String>,
        token: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url,
            public_base_url,
            token,
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, bytes: Vec<u8>, path: &str) -> Result<String> {
        relative_path(path)?;
        let context = format!("upload {path}");
        let mut request = self
            .client
            .put(join_url(&self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, content_type(path))
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&context, e))?;
        check_status(response, &context)?;

        let public = self.public_base_url.as_deref().unwrap_or(&self.base_url);
        Ok(join_url(public, path))
    }
}

fn content_type(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|ext| ext.to_str()) {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
