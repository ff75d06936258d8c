// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The gateway's HTTP interface.
//!
//! Every response to a statement request, successful or not, carries a JSON
//! [`StatementResponse`] body.

use std::path::PathBuf;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::admission::Admission;
use crate::dispatch::{CapturedOutput, ExecutionSummary, SqlClient};
use crate::error::StatementError;
use crate::metrics::Metrics;

mod probe;
mod statement;

/// State shared by all request handlers.
#[derive(Debug, Clone)]
pub struct GatewayState {
    pub client: SqlClient,
    pub scratch_dir: PathBuf,
    pub admission: Admission,
    pub metrics: Metrics,
    /// Fires when the gateway begins shutting down.
    pub shutdown: CancellationToken,
}

/// Builds the gateway's router.
pub fn router(
    state: GatewayState,
    max_request_size: usize,
    cors_allowed_origins: &[HeaderValue],
) -> Router {
    Router::new()
        .route(
            "/v1/sessions/:session_id/statements",
            post(statement::handle_statement),
        )
        .route("/api/livez", get(probe::handle_liveness_check))
        .route("/api/readyz", get(probe::handle_readiness_check))
        .route("/metrics", get(probe::handle_prometheus))
        .layer(DefaultBodyLimit::max(max_request_size))
        .layer(cors_layer(cors_allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[HeaderValue]) -> CorsLayer {
    let allow_origin = if allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(allowed_origins.iter().cloned())
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// The JSON body of every statement response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementResponse {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ResponseDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Structured detail about a statement's execution. Fields that do not apply
/// are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waited_ms: Option<u64>,
}

impl ResponseDetail {
    fn with_output(mut self, stdout: CapturedOutput, stderr: CapturedOutput) -> ResponseDetail {
        (self.stdout, self.stdout_truncated) = split_output(stdout);
        (self.stderr, self.stderr_truncated) = split_output(stderr);
        self
    }

    fn into_option(self) -> Option<ResponseDetail> {
        (self != ResponseDetail::default()).then_some(self)
    }
}

fn split_output(output: CapturedOutput) -> (Option<String>, Option<bool>) {
    let text = (!output.text.is_empty()).then_some(output.text);
    (text, output.truncated.then_some(true))
}

fn millis(duration: Duration) -> Option<u64> {
    Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

impl From<ExecutionSummary> for StatementResponse {
    fn from(summary: ExecutionSummary) -> StatementResponse {
        let message = summary.message();
        let detail = ResponseDetail {
            script_id: Some(summary.script_id),
            exit_code: Some(summary.exit_code),
            job_id: summary.job_id,
            elapsed_ms: millis(summary.elapsed),
            ..Default::default()
        }
        .with_output(summary.stdout, summary.stderr);
        StatementResponse {
            status: ResponseStatus::Ok,
            message,
            detail: detail.into_option(),
        }
    }
}

impl From<StatementError> for StatementResponse {
    fn from(error: StatementError) -> StatementResponse {
        let message = error.to_string();
        let detail = match error {
            StatementError::Validation(_)
            | StatementError::Io { .. }
            | StatementError::Launch { .. } => ResponseDetail::default(),
            StatementError::Execution {
                script_id,
                exit_code,
                signal,
                stdout,
                stderr,
                elapsed,
            } => ResponseDetail {
                script_id: Some(script_id),
                exit_code,
                signal,
                elapsed_ms: millis(elapsed),
                ..Default::default()
            }
            .with_output(stdout, stderr),
            StatementError::Timeout {
                script_id,
                timeout,
                stdout,
                stderr,
            } => ResponseDetail {
                script_id: Some(script_id),
                timeout_ms: millis(timeout),
                ..Default::default()
            }
            .with_output(stdout, stderr),
            StatementError::Backpressure { waited } => ResponseDetail {
                waited_ms: millis(waited),
                ..Default::default()
            },
            StatementError::Cancelled { script_id } => ResponseDetail {
                script_id,
                ..Default::default()
            },
        };
        StatementResponse {
            status: ResponseStatus::Error,
            message,
            detail: detail.into_option(),
        }
    }
}

impl IntoResponse for StatementError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(StatementResponse::from(self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use axum::body::to_bytes;
    use axum::response::IntoResponse;
    use http::StatusCode;
    use uuid::Uuid;

    use super::{ResponseStatus, StatementResponse};
    use crate::dispatch::{CapturedOutput, ExecutionSummary};
    use crate::error::StatementError;

    fn output(text: &str) -> CapturedOutput {
        CapturedOutput {
            text: text.into(),
            truncated: false,
        }
    }

    async fn render(error: StatementError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        assert_eq!(
            response.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn every_error_is_json() {
        let id = Uuid::new_v4();
        let cases = vec![
            (
                StatementError::Validation("No statement field in body".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                StatementError::Io {
                    path: "/scratch/script.sql".into(),
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                StatementError::Launch {
                    program: "/opt/flink/bin/sql-client.sh".into(),
                    source: io::Error::from(io::ErrorKind::NotFound),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                StatementError::Execution {
                    script_id: id,
                    exit_code: Some(1),
                    signal: None,
                    stdout: output(""),
                    stderr: output("syntax error\n"),
                    elapsed: Duration::from_millis(12),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                StatementError::Timeout {
                    script_id: id,
                    timeout: Duration::from_secs(5),
                    stdout: output("partial"),
                    stderr: output(""),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                StatementError::Backpressure {
                    waited: Duration::from_secs(10),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                StatementError::Cancelled {
                    script_id: Some(id),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (error, expected) in cases {
            let message = error.to_string();
            let (status, body) = render(error).await;
            assert_eq!(status, expected);
            assert_eq!(body["status"], "error");
            assert_eq!(body["message"], message.as_str());
        }
    }

    #[tokio::test]
    async fn execution_detail() {
        let id = Uuid::new_v4();
        let (_, body) = render(StatementError::Execution {
            script_id: id,
            exit_code: Some(1),
            signal: None,
            stdout: output(""),
            stderr: CapturedOutput {
                text: "syntax error\n".into(),
                truncated: true,
            },
            elapsed: Duration::from_millis(12),
        })
        .await;
        assert_eq!(
            body["detail"],
            serde_json::json!({
                "script_id": id.to_string(),
                "exit_code": 1,
                "stderr": "syntax error\n",
                "stderr_truncated": true,
                "elapsed_ms": 12,
            })
        );
    }

    #[tokio::test]
    async fn validation_has_no_detail() {
        let (_, body) = render(StatementError::Validation("bad".into())).await;
        assert_eq!(
            body,
            serde_json::json!({"status": "error", "message": "bad"})
        );
    }

    #[test]
    fn success_response() {
        let id = Uuid::new_v4();
        let response = StatementResponse::from(ExecutionSummary {
            script_id: id,
            exit_code: 0,
            stdout: output("[INFO] Submitting...\nJob ID: 42\n"),
            stderr: output(""),
            elapsed: Duration::from_millis(1500),
            job_id: Some("42".into()),
        });
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.message, "[INFO] Submitting...\nJob ID: 42");
        let detail = response.detail.unwrap();
        assert_eq!(detail.script_id, Some(id));
        assert_eq!(detail.exit_code, Some(0));
        assert_eq!(detail.job_id.as_deref(), Some("42"));
        assert_eq!(detail.elapsed_ms, Some(1500));
        assert_eq!(detail.stderr, None);
        assert_eq!(detail.stdout_truncated, None);
    }
}
