//! Remote repository backend (GitHub REST API).
//!
//! Only the calls needed for the `search`/`fetch` contract and plain file
//! reads are implemented. A `search` fans out to the code, issue and pull
//! request indexes in parallel and concatenates their results.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    fetch_tool, guess_mime_type,
    ids::{decode_identity, encoded_id, parse_id, sanitize_fragment},
    looks_like_text,
    paths::clean_relative,
    required_str, search_tool, AdapterError, FetchedDocument, HealthStatus, JsonObject,
    KnowledgeAdapter, PromptArgument, PromptDescriptor, PromptMessage, PromptMessages,
    ResourceBody, ResourceContents, ResourceDescriptor, SearchHit, ToolDescriptor, ToolOutput,
    FETCH_TOOL, SEARCH_TOOL,
};

pub const TAG: &str = "github";
pub const URI_PREFIX: &str = "github://";
pub const REQUIRED_KEYS: &[&str] = &["owner", "repo"];

const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw+json";
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";

#[derive(Debug, Clone, Deserialize)]
struct GithubConfig {
    owner: String,
    repo: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default = "default_api_base_url")]
    api_base_url: String,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_max_results() -> usize {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IssueKind {
    Issue,
    PullRequest,
}

impl IssueKind {
    fn id_kind(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::PullRequest => "pr",
        }
    }

    fn qualifier(self) -> &'static str {
        match self {
            Self::Issue => "is:issue",
            Self::PullRequest => "is:pr",
        }
    }
}

#[derive(Debug)]
pub struct GithubAdapter {
    client: reqwest::Client,
    owner: String,
    repo: String,
    token: Option<String>,
    api_base_url: String,
    branch: Option<String>,
    max_results: usize,
}

impl GithubAdapter {
    pub fn from_config(config: &Value) -> Result<Self, AdapterError> {
        let parsed: GithubConfig = serde_json::from_value(config.clone())
            .map_err(|err| AdapterError::InvalidConfig(format!("github config: {err}")))?;

        let name_pattern = Regex::new(r"^[A-Za-z0-9_.-]+$")
            .map_err(|err| AdapterError::InvalidConfig(err.to_string()))?;
        for (key, value) in [("owner", &parsed.owner), ("repo", &parsed.repo)] {
            if !name_pattern.is_match(value) || value.contains("..") {
                return Err(AdapterError::InvalidConfig(format!(
                    "'{key}' must be a plain repository name segment"
                )));
            }
        }
        if parsed.max_results == 0 {
            return Err(AdapterError::InvalidConfig(
                "'max_results' must be at least 1".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AdapterError::InvalidConfig(format!("http client: {err}")))?;

        Ok(Self {
            client,
            owner: parsed.owner,
            repo: parsed.repo,
            token: parsed.token.filter(|token| !token.trim().is_empty()),
            api_base_url: parsed.api_base_url.trim_end_matches('/').to_string(),
            branch: parsed.branch,
            max_results: parsed.max_results,
        })
    }

    fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    fn request(&self, url: &str, accept: &'static str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .get(url)
            .header(header::ACCEPT, accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, AdapterError> {
        let response = builder.send().await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(AdapterError::NotFound(response.url().path().to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AdapterError::Upstream(format!(
                "github denied access to {}",
                self.full_name()
            ))),
            status => Err(AdapterError::Upstream(format!("github returned {status}"))),
        }
    }

    async fn search_code(&self, query: &str) -> Result<Vec<SearchHit>, AdapterError> {
        let url = format!("{}/search/code", self.api_base_url);
        let body: Value = self
            .send(self.request(&url, JSON_MEDIA_TYPE).query(&[
                ("q", format!("{query} repo:{}", self.full_name())),
                ("per_page", self.max_results.to_string()),
            ]))
            .await?
            .json()
            .await?;

        Ok(items(&body)
            .filter_map(|item| {
                let path = item.get("path")?.as_str()?;
                let name = item.get("name").and_then(Value::as_str).unwrap_or(path);
                Some(SearchHit {
                    id: encoded_id("code", name, path),
                    title: path.to_string(),
                    snippet: None,
                    uri: format!("{URI_PREFIX}{}/{path}", self.full_name()),
                    source: None,
                })
            })
            .collect())
    }

    async fn search_issues(&self, query: &str, kind: IssueKind) -> Result<Vec<SearchHit>, AdapterError> {
        let url = format!("{}/search/issues", self.api_base_url);
        let body: Value = self
            .send(self.request(&url, JSON_MEDIA_TYPE).query(&[
                (
                    "q",
                    format!("{query} repo:{} {}", self.full_name(), kind.qualifier()),
                ),
                ("per_page", self.max_results.to_string()),
            ]))
            .await?
            .json()
            .await?;

        Ok(items(&body)
            .filter_map(|item| {
                let number = item.get("number")?.as_u64()?;
                let title = item.get("title").and_then(Value::as_str).unwrap_or_default();
                let snippet = item
                    .get("body")
                    .and_then(Value::as_str)
                    .map(|body| body.chars().take(200).collect::<String>());
                Some(SearchHit {
                    id: encoded_id(kind.id_kind(), title, &number.to_string()),
                    title: format!("#{number} {title}"),
                    snippet,
                    uri: item
                        .get("html_url")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{URI_PREFIX}{}/issues/{number}", self.full_name())),
                    source: None,
                })
            })
            .collect())
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, AdapterError> {
        let (code, issues, pulls) = tokio::join!(
            self.search_code(query),
            self.search_issues(query, IssueKind::Issue),
            self.search_issues(query, IssueKind::PullRequest),
        );

        let mut hits = Vec::new();
        let mut first_error = None;
        let mut failures = 0;
        for (index, result) in [("code", code), ("issues", issues), ("pulls", pulls)] {
            match result {
                Ok(found) => hits.extend(found),
                Err(err) => {
                    failures += 1;
                    tracing::warn!(repo = %self.full_name(), index, error = %err, "github sub-index search failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) if failures == 3 => Err(err),
            _ => Ok(hits),
        }
    }

    async fn read_file(&self, path: &str) -> Result<ResourceContents, AdapterError> {
        let path = clean_relative(path)?;
        if path.is_empty() {
            return Err(AdapterError::InvalidArguments("path must name a file".to_string()));
        }

        let url = format!(
            "{}/repos/{}/contents/{path}",
            self.api_base_url,
            self.full_name()
        );
        let mut builder = self.request(&url, RAW_MEDIA_TYPE);
        if let Some(branch) = &self.branch {
            builder = builder.query(&[("ref", branch)]);
        }
        let bytes = self.send(builder).await?.bytes().await?.to_vec();

        let body = if looks_like_text(&bytes) {
            ResourceBody::Text(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            ResourceBody::Blob(bytes)
        };

        Ok(ResourceContents {
            uri: format!("{URI_PREFIX}{}/{path}", self.full_name()),
            mime_type: guess_mime_type(&path).map(str::to_string),
            body,
        })
    }

    async fn fetch_issue(&self, id: &str, fragment: &str, number: u64) -> Result<FetchedDocument, AdapterError> {
        let url = format!(
            "{}/repos/{}/issues/{number}",
            self.api_base_url,
            self.full_name()
        );
        let issue: Value = self.send(self.request(&url, JSON_MEDIA_TYPE)).await?.json().await?;
        let title = issue.get("title").and_then(Value::as_str).unwrap_or_default();

        // A retitled issue no longer matches the id it was found under.
        if sanitize_fragment(title) != fragment {
            return Err(AdapterError::NotFound(format!("no document with id '{id}'")));
        }

        let body = issue.get("body").and_then(Value::as_str).unwrap_or_default();
        let mut metadata = JsonObject::new();
        metadata.insert("number".to_string(), json!(number));
        if let Some(state) = issue.get("state") {
            metadata.insert("state".to_string(), state.clone());
        }

        Ok(FetchedDocument {
            id: id.to_string(),
            title: format!("#{number} {title}"),
            text: format!("# {title}\n\n{body}"),
            uri: issue
                .get("html_url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{URI_PREFIX}{}/issues/{number}", self.full_name())),
            mime_type: Some("text/markdown".to_string()),
            metadata,
        })
    }

    pub async fn fetch(&self, id: &str) -> Result<FetchedDocument, AdapterError> {
        let not_found = || AdapterError::NotFound(format!("no document with id '{id}'"));
        let parsed = parse_id(id).ok_or_else(not_found)?;
        let identity = decode_identity(&parsed).ok_or_else(not_found)?;

        match parsed.kind {
            "code" => {
                let path = clean_relative(&identity)?;
                let name = path.rsplit('/').next().unwrap_or(path.as_str());
                if sanitize_fragment(name) != parsed.fragment {
                    return Err(not_found());
                }
                let contents = self.read_file(&path).await?;
                let ResourceBody::Text(text) = contents.body else {
                    return Err(AdapterError::InvalidArguments(format!("'{path}' is binary")));
                };
                let mut metadata = JsonObject::new();
                metadata.insert("path".to_string(), json!(path));
                Ok(FetchedDocument {
                    id: id.to_string(),
                    title: path.clone(),
                    text,
                    uri: contents.uri,
                    mime_type: contents.mime_type,
                    metadata,
                })
            }
            "issue" | "pr" => {
                let number = identity.parse::<u64>().map_err(|_| not_found())?;
                self.fetch_issue(id, parsed.fragment, number).await
            }
            _ => Err(not_found()),
        }
    }

    fn path_from_uri<'a>(&self, uri: &'a str) -> Result<&'a str, AdapterError> {
        let rest = uri
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| AdapterError::NotFound(format!("unsupported resource uri '{uri}'")))?;
        let prefix = format!("{}/", self.full_name());
        rest.strip_prefix(prefix.as_str()).ok_or_else(|| {
            AdapterError::PathRejected(format!("'{uri}' is outside {}", self.full_name()))
        })
    }
}

fn items(body: &Value) -> impl Iterator<Item = &Value> {
    body.get("items")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

#[async_trait]
impl KnowledgeAdapter for GithubAdapter {
    fn backend_tag(&self) -> &'static str {
        TAG
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            search_tool(),
            fetch_tool(),
            ToolDescriptor {
                name: "get_file".to_string(),
                description: format!("Read a file from {}", self.full_name()),
                input_schema: json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
            },
        ]
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, AdapterError> {
        Ok(vec![ResourceDescriptor {
            uri: format!("{URI_PREFIX}{}/README.md", self.full_name()),
            name: "README.md".to_string(),
            description: Some(format!("Readme of {}", self.full_name())),
            mime_type: Some("text/markdown".to_string()),
            size: None,
        }])
    }

    async fn list_prompts(&self) -> Vec<PromptDescriptor> {
        vec![PromptDescriptor {
            name: "review_issue".to_string(),
            description: "Review an issue and propose next steps".to_string(),
            arguments: vec![PromptArgument {
                name: "number".to_string(),
                description: "Issue number".to_string(),
                required: true,
            }],
        }]
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: &JsonObject,
    ) -> Result<PromptMessages, AdapterError> {
        if name != "review_issue" {
            return Err(AdapterError::NotFound(format!("prompt '{name}'")));
        }
        let number = match arguments.get("number") {
            Some(Value::Number(number)) => number.as_u64(),
            Some(Value::String(text)) => text.trim().trim_start_matches('#').parse().ok(),
            _ => None,
        }
        .ok_or_else(|| AdapterError::InvalidArguments("'number' must be an issue number".to_string()))?;

        let url = format!(
            "{}/repos/{}/issues/{number}",
            self.api_base_url,
            self.full_name()
        );
        let issue: Value = self.send(self.request(&url, JSON_MEDIA_TYPE)).await?.json().await?;
        let title = issue.get("title").and_then(Value::as_str).unwrap_or_default();
        let body = issue.get("body").and_then(Value::as_str).unwrap_or_default();

        Ok(PromptMessages {
            description: Some(format!("Review of {}#{number}", self.full_name())),
            messages: vec![PromptMessage::user(format!(
                "Review this issue from {} and propose concrete next steps.\n\n# {title}\n\n{body}",
                self.full_name()
            ))],
        })
    }

    async fn execute_tool(
        &self,
        name: &str,
        arguments: JsonObject,
    ) -> Result<ToolOutput, AdapterError> {
        match name {
            SEARCH_TOOL => {
                let query = required_str(&arguments, "query")?;
                Ok(ToolOutput::SearchResults(self.search(query).await?))
            }
            FETCH_TOOL => {
                let id = required_str(&arguments, "id")?;
                Ok(ToolOutput::Document(self.fetch(id).await?))
            }
            "get_file" => {
                let path = required_str(&arguments, "path")?;
                Ok(ToolOutput::Resource(self.read_file(path).await?))
            }
            _ => Err(AdapterError::UnknownTool(name.to_string())),
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceContents, AdapterError> {
        let path = self.path_from_uri(uri)?;
        self.read_file(path).await
    }

    async fn health_check(&self) -> HealthStatus {
        let url = format!("{}/repos/{}", self.api_base_url, self.full_name());
        match self.send(self.request(&url, JSON_MEDIA_TYPE)).await {
            Ok(_) => HealthStatus::healthy(format!("{} is reachable", self.full_name())),
            Err(err) => HealthStatus::unhealthy(format!("{}: {err}", self.full_name())),
        }
    }
}
