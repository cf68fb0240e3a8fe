//! Inbound chat request normalization and validation.
//!
//! Clients send several historical shapes: `message`, `text`, or an OpenAI-style
//! `messages` array, with the model under `model` or `modelId`. Everything is folded into one
//! [`ChatRequest`] before any provider is touched.

use crate::error::ChatError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const MAX_IMAGES: usize = 10;
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_METADATA_ENTRIES: usize = 5;
const ALLOWED_IMAGE_SUBTYPES: &[&str] = &["png", "jpeg", "gif", "webp"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserHint {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "user_tier")]
    pub user_tier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub mime_type: String,
    /// Bare base64 payload, without any `data:` prefix.
    pub base64: String,
    pub decoded_len: usize,
}

impl ImageInput {
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    /// Trimmed user text, possibly empty when images are present.
    pub text: String,
    pub images: Vec<ImageInput>,
    pub model_id: String,
    pub user: Option<UserHint>,
    /// `Some(false)` opts out of streaming for a streaming model family.
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    /// Observability metadata attached to the outbound provider call.
    pub fn metadata(&self, display_name: &str) -> RequestMetadata {
        let mut entries = BTreeMap::new();
        if let Some(user) = &self.user {
            let hints = [
                ("username", user.username.as_ref()),
                ("email", user.email.as_ref()),
                ("userTier", user.user_tier.as_ref()),
            ];
            for (key, value) in hints {
                if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
                    entries.insert(key.to_string(), value.clone());
                }
            }
        }
        entries.insert("model".to_string(), display_name.to_string());
        RequestMetadata::bounded(entries)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetadata(BTreeMap<String, String>);

impl RequestMetadata {
    fn bounded(mut entries: BTreeMap<String, String>) -> Self {
        while entries.len() > MAX_METADATA_ENTRIES {
            entries.pop_last();
        }
        Self(entries)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// JSON object form used as the metadata header value.
    pub fn to_header_value(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        serde_json::to_string(&self.0).ok()
    }
}

/// Folds any accepted inbound body shape into a validated [`ChatRequest`].
pub fn normalize(body: &Value) -> Result<ChatRequest, ChatError> {
    let obj = body
        .as_object()
        .ok_or_else(|| ChatError::validation("invalid_body", "request body must be a JSON object"))?;

    let model_id = read_str(obj, &["model", "modelId", "model_id"])
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ChatError::invalid_param("missing_model", "model", "model is required"))?
        .to_string();

    let mut images = Vec::new();
    let text = match read_str(obj, &["message", "text"]) {
        Some(text) => text.trim().to_string(),
        None => read_first_message(obj, &mut images)?,
    };

    if let Some(raw_images) = obj.get("images").filter(|v| !v.is_null()) {
        let arr = raw_images.as_array().ok_or_else(|| {
            ChatError::invalid_param("invalid_images", "images", "images must be an array")
        })?;
        check_image_count(images.len() + arr.len())?;
        for item in arr {
            images.push(parse_image(item)?);
        }
    }
    check_image_count(images.len())?;

    if text.is_empty() && images.is_empty() {
        return Err(ChatError::invalid_param(
            "missing_message",
            "message",
            "message text or images are required",
        ));
    }

    let user = match obj.get("user").filter(|v| !v.is_null()) {
        Some(v) => Some(serde_json::from_value::<UserHint>(v.clone()).map_err(|err| {
            ChatError::invalid_param("invalid_user", "user", err.to_string())
        })?),
        None => None,
    };

    let stream = obj.get("stream").and_then(|v| v.as_bool());

    Ok(ChatRequest {
        text,
        images,
        model_id,
        user,
        stream,
    })
}

fn check_image_count(count: usize) -> Result<(), ChatError> {
    if count > MAX_IMAGES {
        return Err(ChatError::invalid_param(
            "too_many_images",
            "images",
            format!("at most {MAX_IMAGES} images are allowed, got {count}"),
        ));
    }
    Ok(())
}

fn read_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| obj.get(*key).and_then(|v| v.as_str()))
}

/// `messages[0].content`, either a string or a parts array. Image parts carrying data URIs are
/// collected into `images`.
fn read_first_message(
    obj: &Map<String, Value>,
    images: &mut Vec<ImageInput>,
) -> Result<String, ChatError> {
    let Some(content) = obj
        .get("messages")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|m| m.get("content"))
    else {
        return Ok(String::new());
    };
    match content {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Array(parts) => {
            let mut texts = Vec::new();
            for part in parts {
                match part.get("type").and_then(|v| v.as_str()) {
                    Some("text") => {
                        if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
                            texts.push(t);
                        }
                    }
                    Some("image_url") => {
                        let url = part
                            .get("image_url")
                            .and_then(|v| v.get("url").or(Some(v)))
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        images.push(parse_image_payload(None, url)?);
                    }
                    _ => {}
                }
            }
            Ok(texts.join("\n").trim().to_string())
        }
        Value::Null => Ok(String::new()),
        _ => Err(ChatError::invalid_param(
            "invalid_message",
            "messages",
            "messages[0].content must be a string or an array of parts",
        )),
    }
}

fn parse_image(item: &Value) -> Result<ImageInput, ChatError> {
    let obj = item.as_object().ok_or_else(|| {
        ChatError::invalid_param("invalid_image", "images", "each image must be an object")
    })?;
    let mime = read_str(obj, &["mimeType", "mime_type", "type"]);
    let payload = read_str(obj, &["base64", "data"]).ok_or_else(|| {
        ChatError::invalid_param("invalid_image", "images", "image payload is missing")
    })?;
    parse_image_payload(mime, payload)
}

fn parse_image_payload(declared_mime: Option<&str>, payload: &str) -> Result<ImageInput, ChatError> {
    let (uri_mime, payload) = split_data_uri(payload.trim());
    let mime_type = declared_mime
        .or(uri_mime)
        .map(|m| m.trim().to_ascii_lowercase())
        .ok_or_else(|| {
            ChatError::invalid_param("invalid_image", "images", "image MIME type is missing")
        })?;
    if !is_allowed_image_mime(&mime_type) {
        return Err(ChatError::invalid_param(
            "unsupported_image_type",
            "images",
            format!("image type {mime_type} is not supported"),
        ));
    }

    // Reject before decoding when the encoded form cannot fit under the ceiling.
    if payload.len() / 4 * 3 > MAX_IMAGE_BYTES + 3 {
        return Err(image_too_large());
    }
    let decoded = BASE64.decode(payload).map_err(|err| {
        ChatError::invalid_param(
            "invalid_image",
            "images",
            format!("image payload is not valid base64: {err}"),
        )
    })?;
    if decoded.is_empty() {
        return Err(ChatError::invalid_param(
            "invalid_image",
            "images",
            "image payload is empty",
        ));
    }
    if decoded.len() > MAX_IMAGE_BYTES {
        return Err(image_too_large());
    }
    Ok(ImageInput {
        mime_type,
        base64: payload.to_string(),
        decoded_len: decoded.len(),
    })
}

fn image_too_large() -> ChatError {
    ChatError::invalid_param(
        "image_too_large",
        "images",
        format!("each image must be at most {MAX_IMAGE_BYTES} bytes"),
    )
}

fn split_data_uri(raw: &str) -> (Option<&str>, &str) {
    let Some(rest) = raw.strip_prefix("data:") else {
        return (None, raw);
    };
    match rest.split_once(',') {
        Some((header, data)) => {
            let mime = header.strip_suffix(";base64").unwrap_or(header);
            (Some(mime).filter(|m| !m.is_empty()), data)
        }
        None => (None, raw),
    }
}

fn is_allowed_image_mime(raw: &str) -> bool {
    let Ok(parsed) = raw.parse::<mime::Mime>() else {
        return false;
    };
    parsed.type_() == mime::IMAGE && ALLOWED_IMAGE_SUBTYPES.contains(&parsed.subtype().as_str())
}
