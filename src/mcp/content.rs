//! Normalization of adapter output into protocol content blocks.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::{json, Value};

use crate::adapters::{PromptMessages, ResourceBody, ResourceContents, ToolOutput};

/// `tools/call` result body for one adapter output.
pub fn tool_result(output: ToolOutput) -> Value {
    let structured = structured_content(&output);
    let mut content = Vec::new();
    push_blocks(output, &mut content);

    let mut result = json!({
        "content": content,
        "isError": false,
    });
    if let Some(structured) = structured {
        result["structuredContent"] = structured;
    }
    result
}

fn structured_content(output: &ToolOutput) -> Option<Value> {
    match output {
        ToolOutput::Json(value @ Value::Object(_)) => Some(value.clone()),
        ToolOutput::Json(value) => Some(json!({ "result": value })),
        ToolOutput::SearchResults(hits) => Some(json!({ "results": hits })),
        ToolOutput::Document(document) => to_value(document),
        _ => None,
    }
}

fn push_blocks(output: ToolOutput, content: &mut Vec<Value>) {
    match output {
        ToolOutput::Text(text) => content.push(text_block(text)),
        ToolOutput::Json(value) => content.push(json_text_block(&value)),
        ToolOutput::SearchResults(hits) => {
            content.push(json_text_block(&json!({ "results": hits })));
        }
        ToolOutput::Document(document) => {
            content.push(json_text_block(&to_value(&document).unwrap_or(Value::Null)));
        }
        ToolOutput::Binary { data, mime_type } => {
            if mime_type.starts_with("image/") {
                content.push(json!({
                    "type": "image",
                    "data": STANDARD.encode(&data),
                    "mimeType": mime_type,
                }));
            } else {
                content.push(json!({
                    "type": "resource",
                    "resource": {
                        "uri": format!("data:{mime_type};base64"),
                        "mimeType": mime_type,
                        "blob": STANDARD.encode(&data),
                    }
                }));
            }
        }
        ToolOutput::ResourceLink {
            uri,
            name,
            mime_type,
        } => {
            let mut block = json!({
                "type": "resource_link",
                "uri": uri,
                "name": name,
            });
            if let Some(mime_type) = mime_type {
                block["mimeType"] = json!(mime_type);
            }
            content.push(block);
        }
        ToolOutput::Resource(contents) => content.push(json!({
            "type": "resource",
            "resource": resource_contents(&contents),
        })),
        ToolOutput::Many(outputs) => {
            for output in outputs {
                push_blocks(output, content);
            }
        }
    }
}

fn text_block(text: String) -> Value {
    json!({ "type": "text", "text": text })
}

fn json_text_block(value: &Value) -> Value {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    text_block(text)
}

fn to_value(value: &impl Serialize) -> Option<Value> {
    serde_json::to_value(value).ok()
}

/// One entry of a `resources/read` result.
pub fn resource_contents(contents: &ResourceContents) -> Value {
    let mut entry = json!({ "uri": contents.uri });
    if let Some(mime_type) = &contents.mime_type {
        entry["mimeType"] = json!(mime_type);
    }
    match &contents.body {
        ResourceBody::Text(text) => entry["text"] = json!(text),
        ResourceBody::Blob(bytes) => entry["blob"] = json!(STANDARD.encode(bytes)),
    }
    entry
}

pub fn prompt_result(prompt: PromptMessages) -> Value {
    let messages: Vec<Value> = prompt
        .messages
        .into_iter()
        .map(|message| {
            json!({
                "role": message.role,
                "content": { "type": "text", "text": message.text },
            })
        })
        .collect();

    let mut result = json!({ "messages": messages });
    if let Some(description) = prompt.description {
        result["description"] = json!(description);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FetchedDocument, JsonObject, PromptMessage, SearchHit};

    #[test]
    fn search_hits_render_as_text_and_structured_content() {
        let result = tool_result(ToolOutput::SearchResults(vec![SearchHit {
            id: "doc-notes-0123456789ab".to_string(),
            title: "notes.md".to_string(),
            snippet: None,
            uri: "filesystem://notes.md".to_string(),
            source: None,
        }]));

        assert_eq!(result["isError"], json!(false));
        assert_eq!(result["content"][0]["type"], json!("text"));
        assert!(result["content"][0]["text"]
            .as_str()
            .expect("text")
            .contains("doc-notes-0123456789ab"));
        assert_eq!(
            result["structuredContent"]["results"][0]["uri"],
            json!("filesystem://notes.md")
        );
    }

    #[test]
    fn images_become_image_blocks_and_other_binaries_embedded_resources() {
        let image = tool_result(ToolOutput::Binary {
            data: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
        });
        assert_eq!(image["content"][0]["type"], json!("image"));
        assert_eq!(image["content"][0]["data"], json!("AQID"));

        let pdf = tool_result(ToolOutput::Binary {
            data: vec![1, 2, 3],
            mime_type: "application/pdf".to_string(),
        });
        assert_eq!(pdf["content"][0]["type"], json!("resource"));
        assert_eq!(pdf["content"][0]["resource"]["blob"], json!("AQID"));
    }

    #[test]
    fn many_flattens_and_links_keep_their_uri() {
        let result = tool_result(ToolOutput::Many(vec![
            ToolOutput::Text("hello".to_string()),
            ToolOutput::ResourceLink {
                uri: "github://acme/site/README.md".to_string(),
                name: "README.md".to_string(),
                mime_type: Some("text/markdown".to_string()),
            },
        ]));
        let content = result["content"].as_array().expect("content");
        assert_eq!(content.len(), 2);
        assert_eq!(content[1]["type"], json!("resource_link"));
        assert_eq!(content[1]["mimeType"], json!("text/markdown"));
        assert!(result.get("structuredContent").is_none());
    }

    #[test]
    fn documents_and_scalars_are_structured_objects() {
        let document = tool_result(ToolOutput::Document(FetchedDocument {
            id: "doc-a-0".to_string(),
            title: "a".to_string(),
            text: "body".to_string(),
            uri: "filesystem://a".to_string(),
            mime_type: None,
            metadata: JsonObject::new(),
        }));
        assert_eq!(document["structuredContent"]["text"], json!("body"));

        let scalar = tool_result(ToolOutput::Json(json!(3)));
        assert_eq!(scalar["structuredContent"], json!({ "result": 3 }));
    }

    #[test]
    fn resource_contents_encode_blobs() {
        let entry = resource_contents(&ResourceContents {
            uri: "filesystem://logo.png".to_string(),
            mime_type: Some("image/png".to_string()),
            body: ResourceBody::Blob(vec![0xff]),
        });
        assert_eq!(entry["blob"], json!("/w=="));
        assert!(entry.get("text").is_none());
    }

    #[test]
    fn prompt_messages_are_text_content() {
        let result = prompt_result(PromptMessages {
            description: Some("Summary".to_string()),
            messages: vec![PromptMessage::user("Summarize this")],
        });
        assert_eq!(result["messages"][0]["role"], json!("user"));
        assert_eq!(result["messages"][0]["content"]["text"], json!("Summarize this"));
        assert_eq!(result["description"], json!("Summary"));
    }
}
