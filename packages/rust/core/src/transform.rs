//! Structural normalization of source items into [`Document`]s.
//!
//! Only what routing through later stages needs: line endings and blank-line
//! runs are normalized, a markup-free text is extracted for enrichment
//! prompts, and a stable record name is derived from the title.

use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;
use sha2::{Digest, Sha256};

use contentmigrator_shared::{BodyFormat, Document, MigratorError, Result, SourceContent};

/// Maximum length of a derived record name.
const MAX_NAME_LEN: usize = 80;

/// Elements whose text never reaches the plain-text view.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Elements that end a line in the plain-text view.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "pre", "blockquote",
    "tr", "table", "section", "article", "header", "footer",
];

/// Normalize a fetched item for the entry `entry_id`.
///
/// The record is keyed by `entry_id`, the id the ledger tracks, so every
/// later write for this entry lands on the same destination row.
pub fn normalize(entry_id: &str, content: &SourceContent) -> Result<Document> {
    let body = normalize_body(&content.body);
    let plain_text = match content.format {
        BodyFormat::Html => html_to_text(&body),
        BodyFormat::Markdown => markdown_to_text(&body),
        BodyFormat::Text => body.clone(),
    };

    let title = content
        .title
        .as_deref()
        .map(collapse_spaces)
        .filter(|t| !t.is_empty())
        .or_else(|| derive_title(content.format, &body, &plain_text))
        .ok_or_else(|| {
            MigratorError::fatal(format!("item {entry_id} has neither a title nor a body"))
        })?;

    let name = Some(slugify(&title))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| slugify(entry_id));

    let content_hash = {
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update([0u8]);
        hasher.update(body.as_bytes());
        format!("{:x}", hasher.finalize())
    };

    Ok(Document {
        source_id: entry_id.to_string(),
        name,
        title,
        body,
        plain_text,
        properties: content.properties.clone(),
        content_hash,
    })
}

/// Unix line endings, no trailing spaces, at most one blank line in a row.
fn normalize_body(body: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let unix = body.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed: Vec<&str> = unix.lines().map(str::trim_end).collect();
    let joined = trimmed.join("\n");
    MULTI_BLANK_RE
        .replace_all(joined.trim_matches('\n'), "\n\n")
        .to_string()
}

fn collapse_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapse whitespace per line and drop empty lines.
fn tidy_lines(text: &str) -> String {
    text.lines()
        .map(collapse_spaces)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::new();

    for node in fragment.root_element().descendants() {
        if let Some(element) = node.value().as_element() {
            if BLOCK_ELEMENTS.contains(&element.name()) {
                out.push('\n');
            }
            continue;
        }
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let skipped = node
            .parent()
            .and_then(|parent| parent.value().as_element())
            .is_some_and(|el| SKIPPED_ELEMENTS.contains(&el.name()));
        if !skipped {
            out.push_str(text);
            out.push(' ');
        }
    }

    tidy_lines(&out)
}

fn markdown_to_text(markdown: &str) -> String {
    static IMAGE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid regex"));
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
    static PREFIX_RE: LazyLock<Regex> =
        LazyLock::new(|| {
            Regex::new(r"(?m)^[ \t]*(#{1,6}|>|[-*+]|\d+\.)[ \t]+").expect("valid regex")
        });
    static EMPHASIS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[*`~]+|__+").expect("valid regex"));

    let without_fences: String = markdown
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");

    let text = IMAGE_RE.replace_all(&without_fences, "");
    let text = LINK_RE.replace_all(&text, "$1");
    let text = PREFIX_RE.replace_all(&text, "");
    let text = EMPHASIS_RE.replace_all(&text, "");
    tidy_lines(&text)
}

fn derive_title(format: BodyFormat, body: &str, plain_text: &str) -> Option<String> {
    static H1_MD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^#\s+(.+)$").expect("valid regex"));

    let heading = match format {
        BodyFormat::Html => {
            let doc = Html::parse_fragment(body);
            scraper::Selector::parse("h1")
                .ok()
                .and_then(|sel| doc.select(&sel).next().map(|el| el.text().collect::<String>()))
        }
        BodyFormat::Markdown => H1_MD_RE.captures(body).map(|caps| caps[1].to_string()),
        BodyFormat::Text => None,
    };

    heading
        .map(|h| collapse_spaces(&h))
        .filter(|h| !h.is_empty())
        .or_else(|| plain_text.lines().next().map(collapse_spaces))
        .filter(|t| !t.is_empty())
}

/// Lowercase, dash-separated, ASCII-safe name.
pub fn slugify(text: &str) -> String {
    let slug = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    match slug.char_indices().nth(MAX_NAME_LEN) {
        Some((idx, _)) => slug[..idx].trim_end_matches('-').to_string(),
        None => slug,
    }
}
