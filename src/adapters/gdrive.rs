//! Cloud drive backend (Google Drive v3 REST API), scoped to one folder.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    fetch_tool,
    ids::{decode_identity, encoded_id, parse_id, sanitize_fragment},
    looks_like_text, required_config_str, required_str, search_tool, AdapterError,
    FetchedDocument, HealthStatus, JsonObject, KnowledgeAdapter, ResourceBody, ResourceContents,
    ResourceDescriptor, SearchHit, ToolDescriptor, ToolOutput, FETCH_TOOL, SEARCH_TOOL,
};

pub const TAG: &str = "gdrive";
pub const URI_PREFIX: &str = "gdrive://";
pub const REQUIRED_KEYS: &[&str] = &["access_token"];

const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/drive/v3";
const GOOGLE_APPS_PREFIX: &str = "application/vnd.google-apps.";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const ID_KIND: &str = "drive";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
struct DriveConfig {
    #[serde(default = "default_folder_id")]
    folder_id: String,
    #[serde(default = "default_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_max_results")]
    max_results: u32,
}

fn default_folder_id() -> String {
    "root".to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_max_results() -> u32 {
    20
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

pub struct DriveAdapter {
    client: reqwest::Client,
    access_token: String,
    folder_id: String,
    api_base_url: String,
    max_results: u32,
    file_id_pattern: Regex,
}

impl std::fmt::Debug for DriveAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveAdapter")
            .field("folder_id", &self.folder_id)
            .field("api_base_url", &self.api_base_url)
            .finish_non_exhaustive()
    }
}

impl DriveAdapter {
    pub fn from_config(config: &Value) -> Result<Self, AdapterError> {
        let access_token = required_config_str(config, "access_token")?.to_string();
        let parsed: DriveConfig = serde_json::from_value(config.clone())
            .map_err(|err| AdapterError::InvalidConfig(format!("gdrive config: {err}")))?;

        let file_id_pattern = Regex::new(r"^[A-Za-z0-9_-]{1,128}$")
            .map_err(|err| AdapterError::InvalidConfig(err.to_string()))?;
        if !file_id_pattern.is_match(&parsed.folder_id) {
            return Err(AdapterError::InvalidConfig(
                "'folder_id' must be a drive folder id".to_string(),
            ));
        }
        if parsed.max_results == 0 {
            return Err(AdapterError::InvalidConfig(
                "'max_results' must be at least 1".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AdapterError::InvalidConfig(format!("http client: {err}")))?;

        Ok(Self {
            client,
            access_token,
            folder_id: parsed.folder_id,
            api_base_url: parsed.api_base_url.trim_end_matches('/').to_string(),
            max_results: parsed.max_results,
            file_id_pattern,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response, AdapterError> {
        let response = self
            .client
            .get(format!("{}/{path}", self.api_base_url))
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(AdapterError::NotFound(path.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(AdapterError::Upstream("drive rejected the access token".to_string()))
            }
            status => Err(AdapterError::Upstream(format!("drive returned {status}"))),
        }
    }

    async fn list_files(&self, extra_filter: Option<String>, page_size: u32) -> Result<Vec<DriveFile>, AdapterError> {
        let mut filter = format!(
            "'{}' in parents and trashed = false and mimeType != '{FOLDER_MIME_TYPE}'",
            self.folder_id
        );
        if let Some(extra) = extra_filter {
            filter.push_str(" and ");
            filter.push_str(&extra);
        }

        let list: DriveFileList = self
            .get(
                "files",
                &[
                    ("q", filter),
                    ("pageSize", page_size.to_string()),
                    (
                        "fields",
                        "files(id,name,mimeType,parents,modifiedTime,size)".to_string(),
                    ),
                ],
            )
            .await?
            .json()
            .await?;
        Ok(list.files)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, AdapterError> {
        let literal = escape_query_literal(query);
        let files = self
            .list_files(
                Some(format!(
                    "(name contains '{literal}' or fullText contains '{literal}')"
                )),
                self.max_results,
            )
            .await?;

        Ok(files
            .into_iter()
            .map(|file| SearchHit {
                id: encoded_id(ID_KIND, &file.name, &file.id),
                snippet: file.modified_time.map(|modified| format!("modified {modified}")),
                uri: format!("{URI_PREFIX}{}", file.id),
                title: file.name,
                source: None,
            })
            .collect())
    }

    /// Loads file metadata and enforces that the file lives directly in the
    /// configured folder.
    async fn file_in_folder(&self, file_id: &str) -> Result<DriveFile, AdapterError> {
        if !self.file_id_pattern.is_match(file_id) {
            return Err(AdapterError::PathRejected(format!("'{file_id}' is not a drive file id")));
        }

        let file: DriveFile = self
            .get(
                &format!("files/{file_id}"),
                &[("fields", "id,name,mimeType,parents,modifiedTime,size".to_string())],
            )
            .await?
            .json()
            .await?;

        if !file.parents.iter().any(|parent| parent == &self.folder_id) {
            return Err(AdapterError::PathRejected(format!(
                "'{file_id}' is outside the configured folder"
            )));
        }
        Ok(file)
    }

    async fn download(&self, file: &DriveFile) -> Result<ResourceContents, AdapterError> {
        let (response, mime_type) = if file.mime_type.starts_with(GOOGLE_APPS_PREFIX) {
            let response = self
                .get(
                    &format!("files/{}/export", file.id),
                    &[("mimeType", "text/plain".to_string())],
                )
                .await?;
            (response, "text/plain".to_string())
        } else {
            let response = self
                .get(&format!("files/{}", file.id), &[("alt", "media".to_string())])
                .await?;
            (response, file.mime_type.clone())
        };

        let bytes = response.bytes().await?.to_vec();
        let body = if looks_like_text(&bytes) {
            ResourceBody::Text(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            ResourceBody::Blob(bytes)
        };

        Ok(ResourceContents {
            uri: format!("{URI_PREFIX}{}", file.id),
            mime_type: Some(mime_type),
            body,
        })
    }

    pub async fn fetch(&self, id: &str) -> Result<FetchedDocument, AdapterError> {
        let not_found = || AdapterError::NotFound(format!("no document with id '{id}'"));
        let parsed = parse_id(id)
            .filter(|parsed| parsed.kind == ID_KIND)
            .ok_or_else(not_found)?;
        let file_id = decode_identity(&parsed).ok_or_else(not_found)?;

        let file = self.file_in_folder(&file_id).await?;
        if sanitize_fragment(&file.name) != parsed.fragment {
            return Err(not_found());
        }

        let contents = self.download(&file).await?;
        let ResourceBody::Text(text) = contents.body else {
            return Err(AdapterError::InvalidArguments(format!("'{}' is binary", file.name)));
        };

        let mut metadata = JsonObject::new();
        metadata.insert("drive_mime_type".to_string(), json!(file.mime_type));
        if let Some(modified) = &file.modified_time {
            metadata.insert("modified_time".to_string(), json!(modified));
        }

        Ok(FetchedDocument {
            id: id.to_string(),
            title: file.name,
            text,
            uri: contents.uri,
            mime_type: contents.mime_type,
            metadata,
        })
    }
}

/// Escapes a value for use inside a single-quoted Drive query literal.
fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl KnowledgeAdapter for DriveAdapter {
    fn backend_tag(&self) -> &'static str {
        TAG
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![search_tool(), fetch_tool()]
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, AdapterError> {
        let files = self.list_files(None, LIST_PAGE_SIZE).await?;
        Ok(files
            .into_iter()
            .map(|file| ResourceDescriptor {
                uri: format!("{URI_PREFIX}{}", file.id),
                description: file.modified_time.map(|modified| format!("modified {modified}")),
                mime_type: Some(file.mime_type),
                size: file.size.and_then(|size| size.parse().ok()),
                name: file.name,
            })
            .collect())
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
            _ => Err(AdapterError::UnknownTool(name.to_string())),
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceContents, AdapterError> {
        let file_id = uri
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| AdapterError::NotFound(format!("unsupported resource uri '{uri}'")))?;
        let file = self.file_in_folder(file_id).await?;
        self.download(&file).await
    }

    async fn health_check(&self) -> HealthStatus {
        match self.get("about", &[("fields", "user".to_string())]).await {
            Ok(_) => HealthStatus::healthy("drive api reachable"),
            Err(err) => HealthStatus::unhealthy(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        extract::{Path, Query},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use std::collections::HashMap;

    use super::*;

    async fn fake_drive() -> String {
        let app = Router::new()
            .route(
                "/files",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    let q = params.get("q").cloned().unwrap_or_default();
                    if !q.contains("'folder-1' in parents") {
                        return Json(json!({ "files": [] }));
                    }
                    Json(json!({ "files": [{
                        "id": "doc-1",
                        "name": "Roadmap 2026",
                        "mimeType": "application/vnd.google-apps.document",
                        "parents": ["folder-1"]
                    }] }))
                }),
            )
            .route(
                "/files/{id}",
                get(
                    |Path(id): Path<String>, Query(params): Query<HashMap<String, String>>| async move {
                        if params.get("alt").map(String::as_str) == Some("media") {
                            return "raw bytes".into_response();
                        }
                        let parents = if id == "doc-1" { "folder-1" } else { "elsewhere" };
                        Json(json!({
                            "id": id,
                            "name": "Roadmap 2026",
                            "mimeType": "application/vnd.google-apps.document",
                            "parents": [parents]
                        }))
                        .into_response()
                    },
                ),
            )
            .route(
                "/files/{id}/export",
                get(|| async { "Ship the exchange server." }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake drive");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn adapter(api_base_url: &str) -> DriveAdapter {
        DriveAdapter::from_config(&json!({
            "access_token": "ya29.test",
            "folder_id": "folder-1",
            "api_base_url": api_base_url
        }))
        .expect("adapter")
    }

    #[tokio::test]
    async fn search_then_fetch_exports_google_docs_as_text() {
        let base = fake_drive().await;
        let adapter = adapter(&base);

        let hits = adapter.search("roadmap").await.expect("search");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].id.starts_with("drive-roadmap_2026-"));

        let document = adapter.fetch(&hits[0].id).await.expect("fetch");
        assert_eq!(document.text, "Ship the exchange server.");
        assert_eq!(document.uri, "gdrive://doc-1");
    }

    #[tokio::test]
    async fn files_outside_folder_are_rejected() {
        let base = fake_drive().await;
        let error = adapter(&base)
            .read_resource("gdrive://doc-2")
            .await
            .expect_err("outside folder");
        assert!(matches!(error, AdapterError::PathRejected(_)));
    }

    #[tokio::test]
    async fn malformed_file_ids_are_rejected_before_any_request() {
        let error = adapter("http://127.0.0.1:9")
            .read_resource("gdrive://../../about")
            .await
            .expect_err("bad id");
        assert!(matches!(error, AdapterError::PathRejected(_)));
    }

    #[test]
    fn query_literals_are_escaped() {
        assert_eq!(escape_query_literal("o'brien"), "o\\'brien");
    }

    #[test]
    fn access_token_is_required() {
        let error = DriveAdapter::from_config(&json!({ "folder_id": "abc" })).expect_err("no token");
        assert!(matches!(error, AdapterError::InvalidConfig(_)));
    }
}
