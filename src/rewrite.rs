//! Request body rewriting for JSON routes
//!
//! Every function here reports whether it changed the body, so the handler only re-serialises
//! bodies that were actually modified.
use crate::config::ModelConfig;
use serde_json::{Value, json};
use tracing::debug;

/// Apply every configured rewrite for `model` to a JSON request body.
pub fn apply_model_rewrites(body: &mut Value, model: &ModelConfig) -> bool {
    let mut changed = false;
    if let Some(prefix) = &model.message_prefix {
        changed |= apply_message_prefix(body, prefix);
    }
    if let Some(name) = &model.use_model_name {
        changed |= rewrite_model_name(body, name);
    }
    if let Some(cache_prompt) = model.cache_prompt {
        changed |= inject_cache_prompt(body, cache_prompt);
    }
    changed
}

/// Prepend `prefix` to the content of the first user message.
///
/// String content is prefixed directly. For structured content the first text part is prefixed,
/// or a text part is inserted at the front if there is none.
pub fn apply_message_prefix(body: &mut Value, prefix: &str) -> bool {
    let Some(message) = body
        .get_mut("messages")
        .and_then(Value::as_array_mut)
        .and_then(|messages| {
            messages
                .iter_mut()
                .find(|message| message.get("role").and_then(Value::as_str) == Some("user"))
        })
    else {
        return false;
    };

    match message.get_mut("content") {
        Some(Value::String(content)) => {
            content.insert_str(0, prefix);
            true
        }
        Some(Value::Array(parts)) => {
            let first_text = parts.iter().position(|part| {
                part.get("type").and_then(Value::as_str) == Some("text")
                    && part.get("text").is_some_and(Value::is_string)
            });
            match first_text {
                Some(index) => {
                    if let Some(Value::String(text)) = parts[index].get_mut("text") {
                        text.insert_str(0, prefix);
                    }
                }
                None => parts.insert(0, json!({"type": "text", "text": prefix})),
            }
            true
        }
        _ => {
            debug!("First user message has no usable content, not applying prefix");
            false
        }
    }
}

/// Replace the `model` field with the name the backend expects.
pub fn rewrite_model_name(body: &mut Value, name: &str) -> bool {
    match body.get_mut("model") {
        Some(model) if model.as_str() != Some(name) => {
            *model = Value::String(name.to_string());
            true
        }
        _ => false,
    }
}

/// Set `cache_prompt` unless the request already carries one.
pub fn inject_cache_prompt(body: &mut Value, cache_prompt: bool) -> bool {
    match body.as_object_mut() {
        Some(object) if !object.contains_key("cache_prompt") => {
            object.insert("cache_prompt".to_string(), Value::Bool(cache_prompt));
            true
        }
        _ => false,
    }
}
