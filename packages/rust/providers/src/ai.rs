//! AI provider variants.
//!
//! The variant set is closed and chosen once at startup, so dispatch is a
//! plain `match` over [`Provider`] rather than a trait object.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use contentmigrator_shared::{
    AiConfig, AiProvider, MigratorError, ProviderKind, RemoteTaskStatus, Result, read_secret,
};

use crate::{build_client, check_status, join_url, transport_error};

/// Summary length cap for the extractive variant, in characters.
const EXTRACTIVE_SUMMARY_CHARS: usize = 280;

/// Title length cap for generated titles, in characters.
const TITLE_CHARS: usize = 80;

/// Body excerpt sent to remote models, in characters.
const PROMPT_EXCERPT_CHARS: usize = 6_000;

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// The configured AI provider.
pub enum Provider {
    Extractive(ExtractiveProvider),
    OpenAi(OpenAiProvider),
}

impl Provider {
    /// Build the variant named in `[ai]`, reading its key from the environment.
    pub fn from_config(config: &AiConfig) -> Result<Self> {
        match config.provider {
            ProviderKind::Extractive => Ok(Self::Extractive(ExtractiveProvider)),
            ProviderKind::OpenAi => {
                let api_key = read_secret(&config.api_key_env)?;
                Ok(Self::OpenAi(OpenAiProvider::new(
                    config.base_url.clone(),
                    config.model.clone(),
                    api_key,
                    config.image_base_url.clone(),
                    config.image_model.clone(),
                )?))
            }
        }
    }
}

#[async_trait]
impl AiProvider for Provider {
    fn name(&self) -> &str {
        match self {
            Self::Extractive(p) => p.name(),
            Self::OpenAi(p) => p.name(),
        }
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        match self {
            Self::Extractive(p) => p.summarize(text).await,
            Self::OpenAi(p) => p.summarize(text).await,
        }
    }

    async fn title(&self, text: &str, current: Option<&str>) -> Result<String> {
        match self {
            Self::Extractive(p) => p.title(text, current).await,
            Self::OpenAi(p) => p.title(text, current).await,
        }
    }

    async fn keywords(&self, text: &str, max: usize) -> Result<Vec<String>> {
        match self {
            Self::Extractive(p) => p.keywords(text, max).await,
            Self::OpenAi(p) => p.keywords(text, max).await,
        }
    }

    async fn create_image_task(&self, prompt: &str) -> Result<String> {
        match self {
            Self::Extractive(p) => p.create_image_task(prompt).await,
            Self::OpenAi(p) => p.create_image_task(prompt).await,
        }
    }

    async fn poll_image_task(&self, task_id: &str) -> Result<RemoteTaskStatus> {
        match self {
            Self::Extractive(p) => p.poll_image_task(task_id).await,
            Self::OpenAi(p) => p.poll_image_task(task_id).await,
        }
    }

    async fn download(&self, result_url: &str) -> Result<Vec<u8>> {
        match self {
            Self::Extractive(p) => p.download(result_url).await,
            Self::OpenAi(p) => p.download(result_url).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Extractive
// ---------------------------------------------------------------------------

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?](\s+|$)").expect("valid sentence regex"));

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9\-]{2,}").expect("valid word regex"));

const STOPWORDS: &[&str] = &[
    "about", "after", "all", "also", "and", "any", "are", "because", "been", "before", "being",
    "but", "can", "could", "did", "does", "each", "for", "from", "had", "has", "have", "her",
    "here", "his", "how", "into", "its", "just", "more", "most", "not", "now", "only", "other",
    "our", "out", "over", "should", "some", "such", "than", "that", "the", "their", "them",
    "then", "there", "these", "they", "this", "those", "through", "too", "under", "very", "was",
    "were", "what", "when", "where", "which", "while", "who", "why", "will", "with", "would",
    "you", "your",
];

/// Heuristic provider: no network, no image generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveProvider;

#[async_trait]
impl AiProvider for ExtractiveProvider {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MigratorError::fatal("cannot summarize empty text"));
        }

        // First two sentences.
        let mut end = text.len();
        for (i, m) in SENTENCE_END.find_iter(text).enumerate() {
            if i == 1 {
                end = m.start() + 1;
                break;
            }
        }
        Ok(truncate_chars(text[..end].trim(), EXTRACTIVE_SUMMARY_CHARS))
    }

    async fn title(&self, text: &str, current: Option<&str>) -> Result<String> {
        if let Some(current) = current.map(str::trim).filter(|c| !c.is_empty()) {
            return Ok(truncate_chars(current, TITLE_CHARS));
        }
        text.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| truncate_chars(line.trim_end_matches(['.', ':']), TITLE_CHARS))
            .ok_or_else(|| MigratorError::fatal("cannot derive a title from empty text"))
    }

    async fn keywords(&self, text: &str, max: usize) -> Result<Vec<String>> {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        for (position, m) in WORD.find_iter(text).enumerate() {
            let word = m.as_str().to_lowercase();
            if STOPWORDS.contains(&word.as_str()) {
                continue;
            }
            counts.entry(word).or_insert((0, position)).0 += 1;
        }

        let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then(a.1.1.cmp(&b.1.1)));
        Ok(ranked.into_iter().take(max).map(|(word, _)| word).collect())
    }

    async fn create_image_task(&self, _prompt: &str) -> Result<String> {
        Err(MigratorError::fatal(
            "the extractive provider cannot generate images",
        ))
    }

    async fn poll_image_task(&self, task_id: &str) -> Result<RemoteTaskStatus> {
        Err(MigratorError::NotFound(format!("image task {task_id}")))
    }

    async fn download(&self, result_url: &str) -> Result<Vec<u8>> {
        Err(MigratorError::NotFound(result_url.to_string()))
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible
// ---------------------------------------------------------------------------

/// OpenAI-compatible chat completions plus a prediction-style image API.
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    image_base_url: Option<String>,
    image_model: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct PredictionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    input: PredictionInput<'a>,
}

#[derive(Debug, Serialize)]
struct PredictionInput<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<PredictionOutput>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PredictionOutput {
    One(String),
    Many(Vec<String>),
}

impl PredictionOutput {
    fn first(self) -> Option<String> {
        match self {
            Self::One(url) => Some(url),
            Self::Many(urls) => urls.into_iter().next(),
        }
    }
}

impl OpenAiProvider {
    pub fn new(
        base_url: String,
        model: String,
        api_key: String,
        image_base_url: Option<String>,
        image_model: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url,
            model,
            api_key,
            image_base_url,
            image_model,
        })
    }

    /// One chat completion with a fixed system instruction.
    #[instrument(skip_all, fields(model = %self.model))]
    async fn complete(&self, instruction: &str, text: &str) -> Result<String> {
        let excerpt = truncate_chars(text, PROMPT_EXCERPT_CHARS);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: instruction,
                },
                ChatMessage {
                    role: "user",
                    content: &excerpt,
                },
            ],
            temperature: 0.2,
        };

        let response = self
            .client
            .post(join_url(&self.base_url, "chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("chat completion", e))?;
        let body: ChatResponse = check_status(response, "chat completion")?
            .json()
            .await
            .map_err(|e| transport_error("chat completion", e))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| MigratorError::Transient("chat completion returned no content".into()))?;

        debug!(chars = content.len(), "chat completion finished");
        Ok(content)
    }

    fn image_base(&self) -> Result<&str> {
        self.image_base_url
            .as_deref()
            .ok_or_else(|| MigratorError::fatal("ai.image_base_url is not configured"))
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        self.complete(
            "Summarize the following article in at most two sentences. \
             Reply with the summary only.",
            text,
        )
        .await
    }

    async fn title(&self, text: &str, current: Option<&str>) -> Result<String> {
        let instruction = match current {
            Some(current) => format!(
                "Improve this article title: \"{current}\". \
                 Reply with one title of at most {TITLE_CHARS} characters and nothing else."
            ),
            None => format!(
                "Write a title for the following article. \
                 Reply with one title of at most {TITLE_CHARS} characters and nothing else."
            ),
        };
        let title = self.complete(&instruction, text).await?;
        Ok(truncate_chars(title.trim_matches('"'), TITLE_CHARS))
    }

    async fn keywords(&self, text: &str, max: usize) -> Result<Vec<String>> {
        let instruction = format!(
            "List at most {max} short lowercase keywords for the following article, \
             separated by commas. Reply with the list only."
        );
        let reply = self.complete(&instruction, text).await?;
        Ok(parse_keyword_list(&reply, max))
    }

    #[instrument(skip_all)]
    async fn create_image_task(&self, prompt: &str) -> Result<String> {
        let url = join_url(self.image_base()?, "predictions");
        let request = PredictionRequest {
            model: self.image_model.as_deref(),
            input: PredictionInput { prompt },
        };
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("create image task", e))?;
        let prediction: Prediction = check_status(response, "create image task")?
            .json()
            .await
            .map_err(|e| transport_error("create image task", e))?;

        debug!(task_id = %prediction.id, status = %prediction.status, "image task created");
        Ok(prediction.id)
    }

    async fn poll_image_task(&self, task_id: &str) -> Result<RemoteTaskStatus> {
        let context = format!("poll image task {task_id}");
        let url = join_url(self.image_base()?, &format!("predictions/{task_id}"));
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| transport_error(&context, e))?;
        let prediction: Prediction = check_status(response, &context)?
            .json()
            .await
            .map_err(|e| transport_error(&context, e))?;

        Ok(match prediction.status.as_str() {
            "succeeded" => match prediction.output.and_then(PredictionOutput::first) {
                Some(url) => RemoteTaskStatus::succeeded(url),
                None => RemoteTaskStatus::failed("task succeeded without output"),
            },
            "failed" | "canceled" => RemoteTaskStatus::failed(
                prediction
                    .error
                    .unwrap_or_else(|| format!("task {}", prediction.status)),
            ),
            _ => RemoteTaskStatus::pending(),
        })
    }

    async fn download(&self, result_url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(result_url)
            .send()
            .await
            .map_err(|e| transport_error("download image", e))?;
        let bytes = check_status(response, "download image")?
            .bytes()
            .await
            .map_err(|e| transport_error("download image", e))?;
        Ok(bytes.to_vec())
    }
}

/// Split a comma or newline separated keyword reply.
fn parse_keyword_list(reply: &str, max: usize) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for raw in reply.split([',', '\n']) {
        let keyword = raw
            .trim()
            .trim_start_matches(|c: char| c == '-' || c == '*' || c.is_ascii_digit() || c == '.')
            .trim()
            .to_lowercase();
        if !keyword.is_empty() && !keywords.contains(&keyword) {
            keywords.push(keyword);
        }
    }
    keywords.truncate(max);
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;
    use contentmigrator_shared::RemoteTaskState;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn openai(server: &MockServer) -> OpenAiProvider {
        OpenAiProvider::new(
            server.uri(),
            "test-model".into(),
            "key".into(),
            Some(server.uri()),
            Some("image-model".into()),
        )
        .unwrap()
    }

    fn chat_reply(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        }))
    }

    #[tokio::test]
    async fn extractive_summary_takes_two_sentences() {
        let provider = ExtractiveProvider;
        let summary = provider
            .summarize("Rust is fast. It is also safe. Nobody reads this one.")
            .await
            .unwrap();
        assert_eq!(summary, "Rust is fast. It is also safe.");
        assert!(provider.summarize("   ").await.is_err());
    }

    #[tokio::test]
    async fn extractive_title_prefers_current() {
        let provider = ExtractiveProvider;
        assert_eq!(
            provider.title("body", Some("  Existing ")).await.unwrap(),
            "Existing"
        );
        assert_eq!(
            provider.title("\n\nGetting started:\nmore", None).await.unwrap(),
            "Getting started"
        );
    }

    #[tokio::test]
    async fn extractive_keywords_rank_by_frequency() {
        let provider = ExtractiveProvider;
        let keywords = provider
            .keywords(
                "Tokio runtime. The tokio scheduler and the runtime. Tokio tasks.",
                2,
            )
            .await
            .unwrap();
        assert_eq!(keywords, vec!["tokio", "runtime"]);
    }

    #[tokio::test]
    async fn extractive_cannot_generate_images() {
        let err = ExtractiveProvider
            .create_image_task("a cat")
            .await
            .unwrap_err();
        assert!(matches!(err, MigratorError::Fatal { .. }));
    }

    #[tokio::test]
    async fn openai_chat_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer key"))
            .and(body_partial_json(serde_json::json!({"model": "test-model"})))
            .respond_with(chat_reply("1. Rust, async\n- Tokio, rust"))
            .mount(&server)
            .await;

        let provider = openai(&server);
        let keywords = provider.keywords("text", 5).await.unwrap();
        assert_eq!(keywords, vec!["rust", "async", "tokio"]);
    }

    #[tokio::test]
    async fn openai_maps_rate_limits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let err = openai(&server).summarize("text").await.unwrap_err();
        assert!(matches!(
            err,
            MigratorError::RateLimited {
                retry_after_ms: Some(2_000),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn openai_image_task_lifecycle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predictions"))
            .and(body_partial_json(
                serde_json::json!({"model": "image-model", "input": {"prompt": "a cat"}}),
            ))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({"id": "t1", "status": "starting"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/predictions/t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "t1",
                "status": "succeeded",
                "output": [format!("{}/files/t1.png", server.uri())]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/predictions/t2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"id": "t2", "status": "processing"}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/t1.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let provider = openai(&server);
        let task_id = provider.create_image_task("a cat").await.unwrap();
        assert_eq!(task_id, "t1");

        let status = provider.poll_image_task("t1").await.unwrap();
        assert_eq!(status.state, RemoteTaskState::Succeeded);
        let bytes = provider
            .download(status.result_url.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        let pending = provider.poll_image_task("t2").await.unwrap();
        assert_eq!(pending.state, RemoteTaskState::Pending);
    }

    #[test]
    fn provider_from_config_requires_key_for_openai() {
        let mut config = AiConfig::default();
        assert!(matches!(
            Provider::from_config(&config).unwrap(),
            Provider::Extractive(_)
        ));

        config.provider = ProviderKind::OpenAi;
        config.api_key_env = "CM_TEST_PROVIDER_MISSING_KEY".into();
        assert!(Provider::from_config(&config).is_err());
    }
}
