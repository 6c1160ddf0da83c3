//! Knowledge backend adapters
//!
//! Every backend (local folder, repository host, cloud drive, or a composite
//! of several) implements [`KnowledgeAdapter`]. The session layer only ever
//! talks to this trait, so backends can be registered, composed and swapped
//! without the dispatcher knowing their internals.

pub mod composite;
pub mod filesystem;
pub mod gdrive;
pub mod github;
pub mod ids;
pub mod paths;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

pub type JsonObject = Map<String, Value>;

pub const SEARCH_TOOL: &str = "search";
pub const FETCH_TOOL: &str = "fetch";

/// A tool exposed by an adapter.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
}

/// A readable resource exposed by an adapter.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PromptArgument {
    pub name: String,
    pub description: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PromptDescriptor {
    pub name: String,
    pub description: String,
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PromptMessage {
    pub role: &'static str,
    pub text: String,
}

impl PromptMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user",
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessages {
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// One result of the `search` tool. `id` is stable for a given source item
/// and is accepted by `fetch`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    pub uri: String,
    /// Child id for hits produced through a composite adapter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The result of the `fetch` tool.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FetchedDocument {
    pub id: String,
    pub title: String,
    pub text: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: JsonObject,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceBody {
    Text(String),
    Blob(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceContents {
    pub uri: String,
    pub mime_type: Option<String>,
    pub body: ResourceBody,
}

/// Native output of a tool call. The dispatcher normalizes every variant into
/// protocol content blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
    Binary { data: Vec<u8>, mime_type: String },
    ResourceLink {
        uri: String,
        name: String,
        mime_type: Option<String>,
    },
    Resource(ResourceContents),
    SearchResults(Vec<SearchHit>),
    Document(FetchedDocument),
    Many(Vec<ToolOutput>),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
}

impl HealthStatus {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("path rejected: {0}")]
    PathRejected(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl AdapterError {
    /// Stable machine-readable code carried in protocol error data.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::Unreachable(_) => "backend_unreachable",
            Self::NotFound(_) => "not_found",
            Self::PathRejected(_) => "path_rejected",
            Self::UnknownTool(_) => "tool_not_found",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Io(_) => "io_error",
            Self::Upstream(_) => "upstream_error",
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Unreachable(err.to_string())
        } else {
            Self::Upstream(err.to_string())
        }
    }
}

#[async_trait]
pub trait KnowledgeAdapter: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    async fn list_tools(&self) -> Vec<ToolDescriptor>;

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, AdapterError>;

    async fn list_prompts(&self) -> Vec<PromptDescriptor> {
        Vec::new()
    }

    async fn get_prompt(
        &self,
        name: &str,
        _arguments: &JsonObject,
    ) -> Result<PromptMessages, AdapterError> {
        Err(AdapterError::NotFound(format!("prompt '{name}'")))
    }

    async fn execute_tool(
        &self,
        name: &str,
        arguments: JsonObject,
    ) -> Result<ToolOutput, AdapterError>;

    async fn read_resource(&self, uri: &str) -> Result<ResourceContents, AdapterError>;

    async fn health_check(&self) -> HealthStatus;
}

pub fn search_tool() -> ToolDescriptor {
    ToolDescriptor {
        name: SEARCH_TOOL.to_string(),
        description: "Search the knowledge source and return matching items with fetchable ids"
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Text to search for" }
            },
            "required": ["query"]
        }),
    }
}

pub fn fetch_tool() -> ToolDescriptor {
    ToolDescriptor {
        name: FETCH_TOOL.to_string(),
        description: "Fetch the full content of an item returned by search".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Id returned by search" }
            },
            "required": ["id"]
        }),
    }
}

pub fn required_str<'a>(arguments: &'a JsonObject, key: &str) -> Result<&'a str, AdapterError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AdapterError::InvalidArguments(format!("'{key}' must be a non-empty string")))
}

pub fn optional_str<'a>(arguments: &'a JsonObject, key: &str) -> Option<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub fn config_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub fn required_config_str<'a>(config: &'a Value, key: &str) -> Result<&'a str, AdapterError> {
    config_str(config, key)
        .ok_or_else(|| AdapterError::InvalidConfig(format!("'{key}' is required")))
}

/// MIME type from a file extension; `None` when unknown.
pub fn guess_mime_type(name: &str) -> Option<&'static str> {
    let extension = name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "md" | "markdown" => "text/markdown",
        "txt" | "log" | "rst" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        "toml" => "application/toml",
        "xml" => "application/xml",
        "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "h" | "cpp" | "sh" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => return None,
    };
    Some(mime)
}

/// Heuristic used to decide between text and blob content.
pub fn looks_like_text(bytes: &[u8]) -> bool {
    !bytes.iter().take(8 * 1024).any(|byte| *byte == 0) && std::str::from_utf8(bytes).is_ok()
}

/// A window of `text` around the first case-insensitive match of `needle`.
pub fn snippet_around(text: &str, needle: &str, radius: usize) -> Option<String> {
    let lowered = text.to_lowercase();
    let position = lowered.find(&needle.to_lowercase())?;
    let chars: Vec<char> = text.chars().collect();
    let lowered_chars = lowered[..position].chars().count();
    let start = lowered_chars.saturating_sub(radius);
    let end = (lowered_chars + needle.chars().count() + radius).min(chars.len());
    let window: String = chars[start.min(end)..end].iter().collect();
    Some(window.split_whitespace().collect::<Vec<_>>().join(" "))
}
