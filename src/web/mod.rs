pub mod admin;
pub mod streams;
pub mod videos;

use crate::error::StreamError;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// 统一的 JSON 应答：`{success, error?, kind?, pid?, url?, path?, warnings?}`
#[derive(Debug, Default, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 错误分类，见 `StreamError::kind`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// 上传后视频在服务器上的路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

impl From<StreamError> for ApiResponse {
    fn from(e: StreamError) -> Self {
        Self {
            kind: Some(e.kind()),
            ..Self::fail(e.to_string())
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let status = match self.kind {
            None if self.success => StatusCode::OK,
            None => StatusCode::INTERNAL_SERVER_ERROR,
            Some("validation") => StatusCode::BAD_REQUEST,
            Some("precondition") => StatusCode::PRECONDITION_FAILED,
            Some("dependency_failure") => StatusCode::BAD_GATEWAY,
            Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

/// 请求中的主机名（不含端口），用于拼接流地址
pub fn request_host(headers: &HeaderMap) -> String {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            name.to_string()
        }
        _ => host.to_string(),
    }
}
