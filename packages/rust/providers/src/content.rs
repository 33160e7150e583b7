//! Content source adapters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use contentmigrator_shared::{
    ContentSource, MigratorError, Result, SourceConfig, SourceContent, read_secret,
};

use crate::{build_client, check_status, transport_error};

/// Build the configured content source.
pub fn from_config(config: &SourceConfig) -> Result<Arc<dyn ContentSource>> {
    match config {
        SourceConfig::Directory { path } => Ok(Arc::new(DirectorySource::new(path))),
        SourceConfig::Http {
            base_url,
            token_env,
        } => {
            url::Url::parse(base_url).map_err(|e| {
                MigratorError::validation(format!("invalid source base_url '{base_url}': {e}"))
            })?;
            let token = token_env.as_deref().map(read_secret).transpose()?;
            Ok(Arc::new(HttpSource::new(base_url.clone(), token)?))
        }
    }
}

// ---------------------------------------------------------------------------
// DirectorySource
// ---------------------------------------------------------------------------

/// One `<id>.json` file per item, each a serialized [`SourceContent`].
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn item_path(&self, source_ref: &str) -> Result<PathBuf> {
        let valid = !source_ref.is_empty()
            && source_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !source_ref.starts_with('.');
        if !valid {
            return Err(MigratorError::fatal(format!(
                "source ref '{source_ref}' is not a valid item file name"
            )));
        }
        Ok(self.root.join(format!("{source_ref}.json")))
    }
}

#[async_trait]
impl ContentSource for DirectorySource {
    async fn list(&self) -> Result<Vec<String>> {
        let read_dir = std::fs::read_dir(&self.root).map_err(|e| MigratorError::io(&self.root, e))?;

        let mut ids: Vec<String> = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(String::from)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn fetch(&self, source_ref: &str) -> Result<SourceContent> {
        let path = self.item_path(source_ref)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MigratorError::NotFound(display(&path)));
            }
            Err(e) => return Err(MigratorError::Transient(format!("{}: {e}", display(&path)))),
        };

        let mut content: SourceContent = serde_json::from_str(&text).map_err(|e| {
            MigratorError::fatal(format!("{}: invalid item JSON: {e}", display(&path)))
        })?;
        if content.id.is_empty() {
            content.id = source_ref.to_string();
        }
        Ok(content)
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

// ---------------------------------------------------------------------------
// HttpSource
// ---------------------------------------------------------------------------

/// JSON-over-HTTP content API.
///
/// `GET {base}/items` returns `{"items": [{"id": ..}, ..], "next": cursor?}`;
/// `GET {base}/items/{id}` returns one [`SourceContent`].
pub struct HttpSource {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemPage {
    items: Vec<ItemRef>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemRef {
    id: String,
}

impl HttpSource {
    pub fn new(base_url: impl AsRef<str>, token: Option<String>) -> Result<Self> {
        let raw = base_url.as_ref();
        let base_url = Url::parse(raw).map_err(|e| {
            MigratorError::validation(format!("invalid source base_url '{raw}': {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(MigratorError::validation(format!(
                "source base_url '{raw}' cannot carry a path"
            )));
        }
        Ok(Self {
            client: build_client()?,
            base_url,
            token,
        })
    }

    /// `{base}/items`, or `{base}/items/{id}` with `id` as one encoded segment.
    fn items_url(&self, id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("items").extend(id);
        }
        url
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ContentSource for HttpSource {
    #[instrument(skip_all, fields(base_url = %self.base_url))]
    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = self.items_url(None);
            if let Some(next) = &cursor {
                url.query_pairs_mut().append_pair("cursor", next);
            }

            let response = self
                .get(url)
                .send()
                .await
                .map_err(|e| transport_error("list items", e))?;
            let page: ItemPage = check_status(response, "list items")?
                .json()
                .await
                .map_err(|e| transport_error("list items", e))?;

            debug!(count = page.items.len(), "fetched item page");
            ids.extend(page.items.into_iter().map(|item| item.id));

            match page.next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(ids)
    }

    async fn fetch(&self, source_ref: &str) -> Result<SourceContent> {
        let context = format!("fetch item {source_ref}");
        let response = self
            .get(self.items_url(Some(source_ref)))
            .send()
            .await
            .map_err(|e| transport_error(&context, e))?;
        check_status(response, &context)?
            .json()
            .await
            .map_err(|e| transport_error(&context, e))
    }
}
