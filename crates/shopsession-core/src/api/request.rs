//! Re-buildable description of an outbound request.
//!
//! A `reqwest::RequestBuilder` is consumed when sent and multipart forms
//! cannot be cloned, so the wrapper keeps this description instead and builds
//! a fresh request for the initial attempt and for the retry.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder};
use serde::Serialize;

use super::ApiError;

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Text(String),
    /// Raw binary payload; the transport picks the content type.
    Bytes(Vec<u8>),
    /// Form upload; the transport sets the boundary content type.
    Multipart(Vec<MultipartField>),
}

impl RequestBody {
    /// Binary and multipart payloads never get a default content type.
    pub fn is_binary(&self) -> bool {
        matches!(self, RequestBody::Bytes(_) | RequestBody::Multipart(_))
    }
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Text(String),
    File {
        bytes: Vec<u8>,
        file_name: String,
        mime: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct MultipartField {
    pub name: String,
    pub value: FieldValue,
}

impl MultipartField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::Text(value.into()),
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
        mime: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::File {
                bytes,
                file_name: file_name.into(),
                mime,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn patch() -> Self {
        Self::new(Method::PATCH)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    /// Serialize `body` as the JSON payload.
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to serialize body: {}", e)))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn multipart(mut self, fields: Vec<MultipartField>) -> Self {
        self.body = RequestBody::Multipart(fields);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, ApiError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ApiError::InvalidRequest(format!("Invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ApiError::InvalidRequest(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Headers for one attempt: the caller's headers, plus a JSON content
    /// type for non-binary bodies when the caller did not choose one. The
    /// wrapper owns `Authorization`.
    pub(crate) fn effective_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.remove(AUTHORIZATION);
        if !self.body.is_binary() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        headers
    }

    /// Attach the query and body to a builder. Called once per attempt.
    pub(crate) fn apply(&self, builder: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let mut builder = builder.headers(self.effective_headers());
        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }
        let builder = match &self.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.body(value.to_string()),
            RequestBody::Text(text) => builder.body(text.clone()),
            RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
            RequestBody::Multipart(fields) => builder.multipart(build_form(fields)?),
        };
        Ok(builder)
    }
}

fn build_form(fields: &[MultipartField]) -> Result<Form, ApiError> {
    let mut form = Form::new();
    for field in fields {
        form = match &field.value {
            FieldValue::Text(text) => form.text(field.name.clone(), text.clone()),
            FieldValue::File {
                bytes,
                file_name,
                mime,
            } => {
                let mut part = Part::bytes(bytes.clone()).file_name(file_name.clone());
                if let Some(mime) = mime {
                    part = part.mime_str(mime).map_err(|e| {
                        ApiError::InvalidRequest(format!("Invalid MIME type {}: {}", mime, e))
                    })?;
                }
                form.part(field.name.clone(), part)
            }
        };
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_body_defaults_content_type() {
        let request = ApiRequest::post()
            .json(&serde_json::json!({"quantity": 2}))
            .expect("serializable body");
        let headers = request.effective_headers();
        assert_eq!(
            headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
    }

    #[test]
    fn test_caller_content_type_wins() {
        let request = ApiRequest::post()
            .body(RequestBody::Text("a=1".into()))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .expect("valid header");
        let headers = request.effective_headers();
        assert_eq!(
            headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn test_multipart_has_no_default_content_type() {
        let request = ApiRequest::post().multipart(vec![
            MultipartField::text("name", "Box braids"),
            MultipartField::file("image", "braids.png", vec![0x89, 0x50], Some("image/png".into())),
        ]);
        assert!(request.effective_headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_bytes_have_no_default_content_type() {
        let request = ApiRequest::put().body(RequestBody::Bytes(vec![1, 2, 3]));
        assert!(request.effective_headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_invalid_mime_is_rejected() {
        let fields = vec![MultipartField::file("f", "x.bin", vec![], Some("not a mime".into()))];
        assert!(matches!(build_form(&fields), Err(ApiError::InvalidRequest(_))));
    }

    #[test]
    fn test_caller_authorization_is_dropped() {
        let request = ApiRequest::get()
            .header("Authorization", "Bearer stale")
            .expect("valid header");
        assert!(request.effective_headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        assert!(ApiRequest::get().header("bad header", "x").is_err());
    }
}
