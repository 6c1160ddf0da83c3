//! Composite backend: fans every operation out to its children and merges
//! the results, tagging each item with the child it came from.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde_json::{json, Value};

use super::{
    fetch_tool, required_str, search_tool, AdapterError, FetchedDocument, HealthStatus,
    JsonObject, KnowledgeAdapter, PromptDescriptor, PromptMessages, ResourceContents,
    ResourceDescriptor, SearchHit, ToolDescriptor, ToolOutput, FETCH_TOOL, SEARCH_TOOL,
};

pub const TAG: &str = "composite";
pub const URI_PREFIX: &str = "composite://";
pub const REQUIRED_KEYS: &[&str] = &["sources"];

/// Separates the child id from the child's own result id.
const ID_SEPARATOR: &str = "::";
/// Separates the child id from a child-specific tool or prompt name.
const NAME_SEPARATOR: &str = "__";

pub type ChildMap = BTreeMap<String, Arc<dyn KnowledgeAdapter>>;

#[derive(Default)]
pub struct CompositeAdapter {
    children: ChildMap,
    initialized: bool,
}

impl std::fmt::Debug for CompositeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeAdapter")
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("initialized", &self.initialized)
            .finish()
    }
}

pub fn valid_child_id(id: &str) -> bool {
    Regex::new(r"^[a-z0-9]+(?:[-_][a-z0-9]+)*$")
        .map(|pattern| pattern.is_match(id))
        .unwrap_or(false)
}

impl CompositeAdapter {
    /// An adapter with no children. [`Self::initialize`] completes the wiring.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, children: ChildMap) -> Result<(), AdapterError> {
        if self.initialized {
            return Err(AdapterError::InvalidConfig(
                "composite adapter is already initialized".to_string(),
            ));
        }
        if children.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "composite adapter needs at least one source".to_string(),
            ));
        }
        if let Some(bad) = children.keys().find(|id| !valid_child_id(id)) {
            return Err(AdapterError::InvalidConfig(format!(
                "source id '{bad}' must be lowercase alphanumerics separated by single '-' or '_'"
            )));
        }

        self.children = children;
        self.initialized = true;
        Ok(())
    }

    pub fn child_ids(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    fn child(&self, id: &str) -> Result<&Arc<dyn KnowledgeAdapter>, AdapterError> {
        self.children
            .get(id)
            .ok_or_else(|| AdapterError::NotFound(format!("no source named '{id}'")))
    }

    pub async fn search(&self, arguments: &JsonObject) -> Vec<SearchHit> {
        let calls = self.children.iter().map(|(child_id, child)| async move {
            (child_id, child.execute_tool(SEARCH_TOOL, arguments.clone()).await)
        });

        let mut merged = Vec::new();
        for (child_id, result) in join_all(calls).await {
            match result {
                Ok(ToolOutput::SearchResults(hits)) => {
                    merged.extend(hits.into_iter().map(|hit| SearchHit {
                        id: format!("{child_id}{ID_SEPARATOR}{}", hit.id),
                        uri: format!("{URI_PREFIX}{child_id}/{}", hit.uri),
                        source: Some(child_id.clone()),
                        ..hit
                    }));
                }
                Ok(_) => {
                    tracing::warn!(source = %child_id, "composite source returned a non-search result for search");
                }
                Err(err) => {
                    tracing::warn!(source = %child_id, error = %err, "composite source search failed");
                }
            }
        }
        merged
    }

    pub async fn fetch(&self, id: &str) -> Result<FetchedDocument, AdapterError> {
        let (child_id, inner_id) = id
            .split_once(ID_SEPARATOR)
            .ok_or_else(|| AdapterError::NotFound(format!("no document with id '{id}'")))?;
        let child = self.child(child_id)?;

        let mut arguments = JsonObject::new();
        arguments.insert("id".to_string(), json!(inner_id));
        match child.execute_tool(FETCH_TOOL, arguments).await? {
            ToolOutput::Document(document) => Ok(FetchedDocument {
                id: id.to_string(),
                uri: format!("{URI_PREFIX}{child_id}/{}", document.uri),
                ..document
            }),
            _ => Err(AdapterError::Upstream(format!(
                "source '{child_id}' returned a non-document result for fetch"
            ))),
        }
    }
}

#[async_trait]
impl KnowledgeAdapter for CompositeAdapter {
    fn backend_tag(&self) -> &'static str {
        TAG
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let per_child = join_all(self.children.iter().map(|(child_id, child)| async move {
            (child_id, child.list_tools().await)
        }))
        .await;

        let mut tools = vec![search_tool(), fetch_tool()];
        for (child_id, child_tools) in per_child {
            tools.extend(
                child_tools
                    .into_iter()
                    .filter(|tool| tool.name != SEARCH_TOOL && tool.name != FETCH_TOOL)
                    .map(|tool| ToolDescriptor {
                        name: format!("{child_id}{NAME_SEPARATOR}{}", tool.name),
                        description: format!("[{child_id}] {}", tool.description),
                        input_schema: tool.input_schema,
                    }),
            );
        }
        tools
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, AdapterError> {
        let per_child = join_all(self.children.iter().map(|(child_id, child)| async move {
            (child_id, child.list_resources().await)
        }))
        .await;

        let mut resources = Vec::new();
        for (child_id, result) in per_child {
            match result {
                Ok(child_resources) => {
                    resources.extend(child_resources.into_iter().map(|resource| ResourceDescriptor {
                        uri: format!("{URI_PREFIX}{child_id}/{}", resource.uri),
                        ..resource
                    }));
                }
                Err(err) => {
                    tracing::warn!(source = %child_id, error = %err, "composite source resource listing failed");
                }
            }
        }
        Ok(resources)
    }

    async fn list_prompts(&self) -> Vec<PromptDescriptor> {
        let per_child = join_all(self.children.iter().map(|(child_id, child)| async move {
            (child_id, child.list_prompts().await)
        }))
        .await;

        per_child
            .into_iter()
            .flat_map(|(child_id, prompts)| {
                prompts.into_iter().map(move |prompt| PromptDescriptor {
                    name: format!("{child_id}{NAME_SEPARATOR}{}", prompt.name),
                    description: format!("[{child_id}] {}", prompt.description),
                    arguments: prompt.arguments,
                })
            })
            .collect()
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: &JsonObject,
    ) -> Result<PromptMessages, AdapterError> {
        let (child_id, prompt) = name
            .split_once(NAME_SEPARATOR)
            .ok_or_else(|| AdapterError::NotFound(format!("prompt '{name}'")))?;
        self.child(child_id)?.get_prompt(prompt, arguments).await
    }

    async fn execute_tool(
        &self,
        name: &str,
        arguments: JsonObject,
    ) -> Result<ToolOutput, AdapterError> {
        match name {
            SEARCH_TOOL => {
                required_str(&arguments, "query")?;
                Ok(ToolOutput::SearchResults(self.search(&arguments).await))
            }
            FETCH_TOOL => {
                let id = required_str(&arguments, "id")?;
                Ok(ToolOutput::Document(self.fetch(id).await?))
            }
            _ => {
                let (child_id, tool) = name
                    .split_once(NAME_SEPARATOR)
                    .ok_or_else(|| AdapterError::UnknownTool(name.to_string()))?;
                let child = self
                    .children
                    .get(child_id)
                    .ok_or_else(|| AdapterError::UnknownTool(name.to_string()))?;
                child.execute_tool(tool, arguments).await
            }
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceContents, AdapterError> {
        let (child_id, child_uri) = uri
            .strip_prefix(URI_PREFIX)
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(|| AdapterError::NotFound(format!("unsupported resource uri '{uri}'")))?;

        let contents = self.child(child_id)?.read_resource(child_uri).await?;
        Ok(ResourceContents {
            uri: format!("{URI_PREFIX}{child_id}/{}", contents.uri),
            ..contents
        })
    }

    async fn health_check(&self) -> HealthStatus {
        if !self.initialized {
            return HealthStatus::unhealthy("composite adapter has not been initialized");
        }

        let checks = join_all(self.children.iter().map(|(child_id, child)| async move {
            (child_id, child.health_check().await)
        }))
        .await;

        let healthy = checks.iter().all(|(_, status)| status.healthy);
        let message = checks
            .iter()
            .map(|(child_id, status)| {
                format!(
                    "{child_id}: {} ({})",
                    if status.healthy { "ok" } else { "unhealthy" },
                    status.message
                )
            })
            .collect::<Vec<_>>()
            .join("; ");

        HealthStatus { healthy, message }
    }
}

/// Child source entries from a composite configuration blob.
pub fn source_entries(config: &Value) -> Result<Vec<(String, String, Value)>, AdapterError> {
    let sources = config
        .get("sources")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::InvalidConfig("'sources' must be an array".to_string()))?;

    sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            let id = source
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| AdapterError::InvalidConfig(format!("sources[{index}].id is required")))?;
            let backend = source
                .get("backend")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AdapterError::InvalidConfig(format!("sources[{index}].backend is required"))
                })?;
            let child_config = source.get("config").cloned().unwrap_or_else(|| json!({}));
            Ok((id.to_string(), backend.to_string(), child_config))
        })
        .collect()
}
