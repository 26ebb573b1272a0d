use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;
use watira_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use crate::cache::{Artifact, ArtifactCache};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::truncate::{truncate_text, SEARCH_CONTENT_MAX};

pub const DISABLED_MESSAGE: &str = "document search is currently disabled";
const SEARCH_KIND: &str = "search";
const SEARCH_VERSION: &str = "search-1";

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new("<[^<]+?>").unwrap());

#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Full `:search` endpoint. `None` disables the tool.
    pub endpoint: Option<String>,
    pub token: Option<SecretString>,
    pub page_size: u32,
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            page_size: 5,
            timeout: Duration::from_secs(40),
        }
    }
}

/// One search hit as handed to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub source: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
}

pub struct SearchDocumentsTool {
    client: reqwest::Client,
    config: SearchConfig,
    cache: Arc<ArtifactCache>,
}

impl SearchDocumentsTool {
    pub fn new(config: SearchConfig, cache: Arc<ArtifactCache>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("Watira/1.0")
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            cache,
        }
    }

    async fn fetch(&self, endpoint: &str, query: &str) -> Result<Vec<SearchHit>, CacheError> {
        let payload = serde_json::json!({
            "query": query,
            "pageSize": self.config.page_size,
            "contentSearchSpec": {
                "extractiveContentSpec": {
                    "maxExtractiveAnswerCount": self.config.page_size
                }
            }
        });

        let mut request = self.client.post(endpoint).json(&payload);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request
            .send()
            .await
            .map_err(|e| CacheError::Compute(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CacheError::Compute(format!("search failed: HTTP {status}: {body}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CacheError::Compute(format!("failed to parse search response: {e}")))?;
        Ok(parse_results(&body))
    }
}

/// Extract `{source, content}` pairs from a search response. Hits without
/// extractive answers are skipped.
fn parse_results(body: &serde_json::Value) -> Vec<SearchHit> {
    let Some(results) = body["results"].as_array() else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(|result| {
            let doc = &result["document"];
            let data = &doc["derivedStructData"];
            let source = data["title"]
                .as_str()
                .or_else(|| doc["name"].as_str())
                .unwrap_or_default()
                .to_string();

            let content = data["extractive_answers"]
                .as_array()
                .map(|answers| {
                    answers
                        .iter()
                        .filter_map(|a| a["content"].as_str())
                        .filter(|c| !c.is_empty())
                        .map(|c| HTML_TAG.replace_all(c, "").into_owned())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();

            (!content.is_empty()).then(|| SearchHit {
                source,
                content: truncate_text(&content, SEARCH_CONTENT_MAX),
            })
        })
        .collect()
}

#[async_trait]
impl Tool for SearchDocumentsTool {
    fn name(&self) -> &str {
        "search_documents"
    }

    fn description(&self) -> &str {
        "Search the organisation's document index and return relevant passages with their sources"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "A standalone search query"
                }
            }
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let args: SearchArgs = ToolError::parse_args(args)?;
        let query = args.query.trim();
        if query.is_empty() {
            return Err(ToolError::InvalidArguments("query must not be empty".into()));
        }
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .ok_or_else(|| ToolError::Disabled(DISABLED_MESSAGE.into()))?;

        let fp = Fingerprint::of(
            SEARCH_KIND,
            SEARCH_VERSION,
            &serde_json::json!({ "query": query, "page_size": self.config.page_size }),
        );
        let artifact = self
            .cache
            .get_or_compute(&fp, || async {
                let hits = self.fetch(endpoint, query).await?;
                let bytes = serde_json::to_vec(&hits)
                    .map_err(|e| CacheError::Compute(e.to_string()))?;
                Ok(Artifact::new(SEARCH_KIND, "application/json", bytes))
            })
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let hits: Vec<SearchHit> = serde_json::from_slice(&artifact.bytes)
            .map_err(|e| ToolError::ExecutionFailed(format!("corrupt cached search result: {e}")))?;
        debug!(hits = hits.len(), "search complete");

        Ok(ToolOutput::json(serde_json::json!({
            "count": hits.len(),
            "results": hits,
        })))
    }
}
