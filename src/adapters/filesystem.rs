//! Local folder backend.
//!
//! `search` is a recursive walk with case-insensitive name and content
//! substring matching. Walks run on the blocking pool so a large tree never
//! stalls the async workers serving other sessions.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    fetch_tool, guess_mime_type,
    ids::{hashed_id, identity_hash, parse_id, sanitize_fragment},
    looks_like_text, optional_str,
    paths::{clean_relative, ensure_canonical_within, resolve_within},
    required_str, search_tool, snippet_around, AdapterError, FetchedDocument, HealthStatus,
    JsonObject, KnowledgeAdapter, PromptArgument, PromptDescriptor, PromptMessage,
    PromptMessages, ResourceBody, ResourceContents, ResourceDescriptor, SearchHit,
    ToolDescriptor, ToolOutput, FETCH_TOOL, SEARCH_TOOL,
};

pub const TAG: &str = "filesystem";
pub const URI_PREFIX: &str = "filesystem://";
pub const REQUIRED_KEYS: &[&str] = &["root_path"];

const ID_KIND: &str = "file";
const MAX_WALK_ENTRIES: usize = 20_000;
const MAX_LISTED_RESOURCES: usize = 500;
const SNIPPET_RADIUS: usize = 80;

#[derive(Debug, Clone, Deserialize)]
struct FilesystemConfig {
    root_path: PathBuf,
    #[serde(default = "default_max_file_bytes")]
    max_file_bytes: u64,
    #[serde(default)]
    include_hidden: bool,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

fn default_max_results() -> usize {
    20
}

#[derive(Debug, Clone)]
struct FileEntry {
    path: PathBuf,
    relative: String,
    name: String,
    size: u64,
}

#[derive(Debug)]
pub struct FilesystemAdapter {
    root: PathBuf,
    max_file_bytes: u64,
    include_hidden: bool,
    max_results: usize,
}

impl FilesystemAdapter {
    pub fn from_config(config: &Value) -> Result<Self, AdapterError> {
        let parsed: FilesystemConfig = serde_json::from_value(config.clone())
            .map_err(|err| AdapterError::InvalidConfig(format!("filesystem config: {err}")))?;

        if parsed.root_path.as_os_str().is_empty() {
            return Err(AdapterError::InvalidConfig("'root_path' is required".to_string()));
        }
        if parsed.max_results == 0 {
            return Err(AdapterError::InvalidConfig(
                "'max_results' must be at least 1".to_string(),
            ));
        }

        let root = parsed.root_path.canonicalize().map_err(|err| {
            AdapterError::InvalidConfig(format!(
                "root_path '{}' is not accessible: {err}",
                parsed.root_path.display()
            ))
        })?;
        if !root.is_dir() {
            return Err(AdapterError::InvalidConfig(format!(
                "root_path '{}' is not a directory",
                root.display()
            )));
        }

        Ok(Self {
            root,
            max_file_bytes: parsed.max_file_bytes,
            include_hidden: parsed.include_hidden,
            max_results: parsed.max_results,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn entries(&self) -> Result<Vec<FileEntry>, AdapterError> {
        let root = self.root.clone();
        let include_hidden = self.include_hidden;
        tokio::task::spawn_blocking(move || walk_files(&root, include_hidden))
            .await
            .map_err(|err| AdapterError::Io(io::Error::other(err)))?
            .map_err(AdapterError::Io)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, AdapterError> {
        let entries = self.entries().await?;
        let needle = query.to_lowercase();
        let max_file_bytes = self.max_file_bytes;
        let max_results = self.max_results;

        tokio::task::spawn_blocking(move || {
            let mut hits = Vec::new();
            for entry in entries {
                if hits.len() >= max_results {
                    break;
                }

                let name_match = entry.relative.to_lowercase().contains(&needle);
                let snippet = if entry.size <= max_file_bytes {
                    fs::read(&entry.path)
                        .ok()
                        .filter(|bytes| looks_like_text(bytes))
                        .and_then(|bytes| {
                            snippet_around(&String::from_utf8_lossy(&bytes), &needle, SNIPPET_RADIUS)
                        })
                } else {
                    None
                };

                if name_match || snippet.is_some() {
                    hits.push(SearchHit {
                        id: hashed_id(ID_KIND, &entry.name, &entry.relative),
                        title: entry.relative.clone(),
                        snippet,
                        uri: format!("{URI_PREFIX}{}", entry.relative),
                        source: None,
                    });
                }
            }
            hits
        })
        .await
        .map_err(|err| AdapterError::Io(io::Error::other(err)))
    }

    /// Resolves an id produced by [`Self::search`] by rescanning for the entry
    /// with the same name fragment and identity hash.
    pub async fn fetch(&self, id: &str) -> Result<FetchedDocument, AdapterError> {
        let parsed = parse_id(id)
            .filter(|parsed| parsed.kind == ID_KIND)
            .ok_or_else(|| AdapterError::NotFound(format!("no document with id '{id}'")))?;

        let entry = self
            .entries()
            .await?
            .into_iter()
            .find(|entry| {
                sanitize_fragment(&entry.name) == parsed.fragment
                    && identity_hash(&entry.relative) == parsed.tail
            })
            .ok_or_else(|| AdapterError::NotFound(format!("no document with id '{id}'")))?;

        let contents = self.read_relative(&entry.relative).await?;
        let ResourceBody::Text(text) = contents.body else {
            return Err(AdapterError::InvalidArguments(format!(
                "'{}' is binary; read it as a resource instead",
                entry.relative
            )));
        };

        let mut metadata = JsonObject::new();
        metadata.insert("path".to_string(), json!(entry.relative));
        metadata.insert("size".to_string(), json!(entry.size));

        Ok(FetchedDocument {
            id: id.to_string(),
            title: entry.relative.clone(),
            text,
            uri: contents.uri,
            mime_type: contents.mime_type,
            metadata,
        })
    }

    /// Hidden entries stay unreachable by direct path unless configured.
    fn reject_hidden(&self, relative: &str) -> Result<(), AdapterError> {
        if !self.include_hidden && relative.split('/').any(|part| part.starts_with('.')) {
            return Err(AdapterError::PathRejected(format!(
                "'{relative}' is a hidden path"
            )));
        }
        Ok(())
    }

    async fn read_relative(&self, relative: &str) -> Result<ResourceContents, AdapterError> {
        let relative = clean_relative(relative)?;
        self.reject_hidden(&relative)?;
        let candidate = resolve_within(&self.root, &relative)?;
        let path = ensure_canonical_within(&self.root, &candidate)?;

        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(AdapterError::NotFound(format!("'{relative}' is not a file")));
        }
        if metadata.len() > self.max_file_bytes {
            return Err(AdapterError::InvalidArguments(format!(
                "'{relative}' is {} bytes, above the {} byte limit",
                metadata.len(),
                self.max_file_bytes
            )));
        }

        let bytes = tokio::fs::read(&path).await?;
        let mime_type = guess_mime_type(&relative).map(str::to_string);
        let body = if looks_like_text(&bytes) {
            ResourceBody::Text(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            ResourceBody::Blob(bytes)
        };

        Ok(ResourceContents {
            uri: format!("{URI_PREFIX}{relative}"),
            mime_type: mime_type.or_else(|| match body {
                ResourceBody::Text(_) => Some("text/plain".to_string()),
                ResourceBody::Blob(_) => Some("application/octet-stream".to_string()),
            }),
            body,
        })
    }

    async fn list_directory(&self, relative: Option<&str>) -> Result<Value, AdapterError> {
        let relative = clean_relative(relative.unwrap_or("."))?;
        self.reject_hidden(&relative)?;
        let candidate = resolve_within(&self.root, &relative)?;
        let directory = ensure_canonical_within(&self.root, &candidate)?;
        let include_hidden = self.include_hidden;

        let mut listing = tokio::task::spawn_blocking(move || -> io::Result<Vec<Value>> {
            let mut items = Vec::new();
            for entry in fs::read_dir(&directory)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !include_hidden && name.starts_with('.') {
                    continue;
                }
                let file_type = entry.file_type()?;
                let kind = if file_type.is_dir() {
                    "directory"
                } else if file_type.is_symlink() {
                    "symlink"
                } else {
                    "file"
                };
                let size = entry.metadata().map(|metadata| metadata.len()).unwrap_or(0);
                items.push(json!({ "name": name, "type": kind, "size": size }));
            }
            Ok(items)
        })
        .await
        .map_err(|err| AdapterError::Io(io::Error::other(err)))??;

        listing.sort_by(|left, right| {
            left["name"]
                .as_str()
                .unwrap_or_default()
                .cmp(right["name"].as_str().unwrap_or_default())
        });

        Ok(json!({
            "path": if relative.is_empty() { "." } else { relative.as_str() },
            "entries": listing,
        }))
    }
}

fn walk_files(root: &Path, include_hidden: bool) -> io::Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    let mut visited = 0usize;

    while let Some(directory) = pending.pop() {
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(err) if directory != root => {
                tracing::warn!(directory = %directory.display(), error = %err, "skipping unreadable directory");
                continue;
            }
            Err(err) => return Err(err),
        };

        for entry in entries {
            visited += 1;
            if visited > MAX_WALK_ENTRIES {
                tracing::warn!(root = %root.display(), "filesystem walk truncated");
                files.sort_by(|left: &FileEntry, right| left.relative.cmp(&right.relative));
                return Ok(files);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(directory = %directory.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !include_hidden && name.starts_with('.') {
                continue;
            }

            // Symlinks are never followed: they could point outside the root.
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                let path = entry.path();
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let relative = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let size = entry.metadata().map(|metadata| metadata.len()).unwrap_or(0);
                files.push(FileEntry {
                    path,
                    relative,
                    name,
                    size,
                });
            }
        }
    }

    files.sort_by(|left, right| left.relative.cmp(&right.relative));
    Ok(files)
}

#[async_trait]
impl KnowledgeAdapter for FilesystemAdapter {
    fn backend_tag(&self) -> &'static str {
        TAG
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            search_tool(),
            fetch_tool(),
            ToolDescriptor {
                name: "read_file".to_string(),
                description: "Read a file by its path relative to the exchange root".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
            },
            ToolDescriptor {
                name: "list_directory".to_string(),
                description: "List a directory relative to the exchange root".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } }
                }),
            },
        ]
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, AdapterError> {
        let entries = self.entries().await?;
        Ok(entries
            .into_iter()
            .take(MAX_LISTED_RESOURCES)
            .map(|entry| ResourceDescriptor {
                uri: format!("{URI_PREFIX}{}", entry.relative),
                mime_type: guess_mime_type(&entry.name).map(str::to_string),
                name: entry.name,
                description: Some(entry.relative),
                size: Some(entry.size),
            })
            .collect())
    }

    async fn list_prompts(&self) -> Vec<PromptDescriptor> {
        vec![
            PromptDescriptor {
                name: "summarize_document".to_string(),
                description: "Summarize one document from this folder".to_string(),
                arguments: vec![PromptArgument {
                    name: "path".to_string(),
                    description: "Path relative to the exchange root".to_string(),
                    required: true,
                }],
            },
            PromptDescriptor {
                name: "answer_from_documents".to_string(),
                description: "Answer a question using matching documents as context".to_string(),
                arguments: vec![PromptArgument {
                    name: "question".to_string(),
                    description: "The question to answer".to_string(),
                    required: true,
                }],
            },
        ]
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: &JsonObject,
    ) -> Result<PromptMessages, AdapterError> {
        match name {
            "summarize_document" => {
                let path = required_str(arguments, "path")?;
                let contents = self.read_relative(path).await?;
                let ResourceBody::Text(text) = contents.body else {
                    return Err(AdapterError::InvalidArguments(format!("'{path}' is binary")));
                };
                Ok(PromptMessages {
                    description: Some(format!("Summary of {path}")),
                    messages: vec![PromptMessage::user(format!(
                        "Summarize the following document ({path}) in a few paragraphs.\n\n{text}"
                    ))],
                })
            }
            "answer_from_documents" => {
                let question = required_str(arguments, "question")?;
                let hits = self.search(question).await?;
                let context = hits
                    .iter()
                    .map(|hit| {
                        format!(
                            "- {} ({}): {}",
                            hit.title,
                            hit.id,
                            hit.snippet.as_deref().unwrap_or("name match")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(PromptMessages {
                    description: Some("Question with document context".to_string()),
                    messages: vec![PromptMessage::user(format!(
                        "Answer the question using these documents. Use the fetch tool with an id for full text.\n\n{context}\n\nQuestion: {question}"
                    ))],
                })
            }
            _ => Err(AdapterError::NotFound(format!("prompt '{name}'"))),
        }
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
            "read_file" => {
                let path = required_str(&arguments, "path")?;
                Ok(ToolOutput::Resource(self.read_relative(path).await?))
            }
            "list_directory" => Ok(ToolOutput::Json(
                self.list_directory(optional_str(&arguments, "path")).await?,
            )),
            _ => Err(AdapterError::UnknownTool(name.to_string())),
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceContents, AdapterError> {
        let relative = uri
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| AdapterError::NotFound(format!("unsupported resource uri '{uri}'")))?;
        self.read_relative(relative).await
    }

    async fn health_check(&self) -> HealthStatus {
        match tokio::fs::metadata(&self.root).await {
            Ok(metadata) if metadata.is_dir() => {
                HealthStatus::healthy(format!("root '{}' is readable", self.root.display()))
            }
            Ok(_) => HealthStatus::unhealthy(format!("root '{}' is not a directory", self.root.display())),
            Err(err) => HealthStatus::unhealthy(format!("root '{}': {err}", self.root.display())),
        }
    }
}
