//! Multipart form handling for the audio transcription route

use crate::errors::ProxyError;
use axum::extract::{FromRequest, Multipart, Request};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// One part of a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FormField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: Bytes::from(value.into()),
        }
    }
}

/// Read every part of a multipart body into memory.
pub async fn read_form(req: Request) -> Result<Vec<FormField>, ProxyError> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| ProxyError::BadRequest(format!("invalid multipart form: {e}")))?;

    let mut fields = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ProxyError::BadRequest(format!("invalid multipart form: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ProxyError::BadRequest(format!("failed to read field {name}: {e}")))?;
        fields.push(FormField {
            name,
            file_name,
            content_type,
            data,
        });
    }
    Ok(fields)
}

/// Value of the first plain (non-file) field called `name`.
pub fn form_value<'a>(fields: &'a [FormField], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|field| field.name == name && field.file_name.is_none())
        .and_then(|field| std::str::from_utf8(&field.data).ok())
}

/// Replace the value of every plain field called `name`.
pub fn set_form_value(fields: &mut [FormField], name: &str, value: &str) {
    for field in fields
        .iter_mut()
        .filter(|field| field.name == name && field.file_name.is_none())
    {
        field.data = Bytes::copy_from_slice(value.as_bytes());
    }
}

/// Serialise fields as `multipart/form-data`, returning the content type and body.
pub fn encode_form(fields: &[FormField]) -> (String, Bytes) {
    let boundary = new_boundary();
    let mut body = BytesMut::new();

    for field in fields {
        body.put_slice(format!("--{boundary}\r\n").as_bytes());
        let mut disposition = format!(
            "Content-Disposition: form-data; name=\"{}\"",
            escape_quoted(&field.name)
        );
        if let Some(file_name) = &field.file_name {
            disposition.push_str(&format!("; filename=\"{}\"", escape_quoted(file_name)));
        }
        body.put_slice(disposition.as_bytes());
        body.put_slice(b"\r\n");
        if let Some(content_type) = &field.content_type {
            body.put_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.put_slice(b"\r\n");
        body.put_slice(&field.data);
        body.put_slice(b"\r\n");
    }
    body.put_slice(format!("--{boundary}--\r\n").as_bytes());

    (
        format!("multipart/form-data; boundary={boundary}"),
        body.freeze(),
    )
}

fn new_boundary() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("llmswap-{nanos:016x}{count:08x}")
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
