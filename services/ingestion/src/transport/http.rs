use std::collections::HashMap;

use serde::Serialize;

use crate::api::ErrorBody;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    /// Header names are lower-cased by the adapter.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, target: &str) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_json_body(self, body: &str) -> Self {
        let mut request = self.with_header("content-type", "application/json");
        request.body = body.as_bytes().to_vec();
        request
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(err) => Self::internal_server_error(&format!("response encoding failed: {err}")),
        }
    }

    pub fn ok_json<T: Serialize>(value: &T) -> Self {
        Self::json(200, value)
    }

    pub fn ok_text(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; version=0.0.4; charset=utf-8",
            body,
        }
    }

    fn error(status: u16, message: &str, retryable: bool) -> Self {
        let body = ErrorBody {
            error: message.to_string(),
            retryable,
        };
        Self {
            status,
            content_type: "application/json",
            body: serde_json::to_string(&body)
                .unwrap_or_else(|_| "{\"error\":\"internal error\",\"retryable\":false}".into()),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::error(400, message, false)
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::error(401, message, false)
    }

    pub fn forbidden(message: &str) -> Self {
        Self::error(403, message, false)
    }

    pub fn not_found(message: &str) -> Self {
        Self::error(404, message, false)
    }

    pub fn method_not_allowed(message: &str) -> Self {
        Self::error(405, message, false)
    }

    pub fn conflict(message: &str) -> Self {
        Self::error(409, message, false)
    }

    pub fn payload_too_large(message: &str) -> Self {
        Self::error(413, message, false)
    }

    pub fn internal_server_error(message: &str) -> Self {
        Self::error(500, message, true)
    }

    pub fn service_unavailable(message: &str) -> Self {
        Self::error(503, message, true)
    }

    pub fn error_with_status(status: u16, message: &str) -> Self {
        match status {
            400 => Self::bad_request(message),
            401 => Self::unauthorized(message),
            403 => Self::forbidden(message),
            404 => Self::not_found(message),
            405 => Self::method_not_allowed(message),
            409 => Self::conflict(message),
            413 => Self::payload_too_large(message),
            503 => Self::service_unavailable(message),
            _ => Self::internal_server_error(message),
        }
    }
}
