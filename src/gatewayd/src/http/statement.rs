// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The statement endpoint.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use tracing::{field, info_span, warn, Instrument};

use crate::dispatch::ExecutionSummary;
use crate::error::StatementError;
use crate::http::{GatewayState, StatementResponse};
use crate::script::ScriptFile;
use crate::session::SessionId;

/// The body of a statement request.
#[derive(Debug, Deserialize)]
pub struct StatementRequest {
    #[serde(default)]
    pub statement: Option<String>,
}

impl StatementRequest {
    /// Returns the statement, rejecting requests without a usable one.
    ///
    /// A statement that is only whitespace counts as empty: the SQL client
    /// would run nothing and report success.
    fn into_statement(self) -> Result<String, StatementError> {
        match self.statement {
            None => Err(StatementError::Validation(
                "No statement field in body".into(),
            )),
            Some(s) if s.trim().is_empty() => Err(StatementError::Validation(
                "statement must not be empty".into(),
            )),
            Some(s) => Ok(s),
        }
    }
}

/// Runs one statement with the SQL client.
///
/// The response is not sent until the client has exited or been killed, and
/// the script file is gone by the time it is.
pub async fn handle_statement(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    body: Result<Json<StatementRequest>, JsonRejection>,
) -> Result<Json<StatementResponse>, StatementError> {
    let result = run_statement(&state, &session_id, body).await;
    state.metrics.record_outcome(match &result {
        Ok(_) => "ok",
        Err(e) => e.outcome(),
    });
    result.map(|summary| Json(summary.into()))
}

async fn run_statement(
    state: &GatewayState,
    session_id: &str,
    body: Result<Json<StatementRequest>, JsonRejection>,
) -> Result<ExecutionSummary, StatementError> {
    let session_id: SessionId = session_id.parse()?;
    let Json(request) = body.map_err(|e| StatementError::Validation(e.body_text()))?;
    let statement = request.into_statement()?;

    let span = info_span!(
        "statement",
        session_id = %session_id,
        script_id = field::Empty,
    );
    async {
        let _permit = state.admission.acquire().await?;
        let _in_flight = state.metrics.in_flight();

        let script = ScriptFile::create(&state.scratch_dir, &session_id, &statement).await?;
        tracing::Span::current().record("script_id", field::display(script.id()));

        let result = state.client.execute(&script, &state.shutdown).await;
        match &result {
            Ok(summary) => state.metrics.record_duration(summary.elapsed),
            Err(StatementError::Execution { elapsed, .. }) => {
                state.metrics.record_duration(*elapsed)
            }
            Err(_) => (),
        }

        let path = script.path().to_path_buf();
        if let Err(e) = script.remove().await {
            warn!("unable to remove script file {}: {e}", path.display());
        }
        result
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::StatementRequest;
    use crate::error::StatementError;

    fn parse(body: &str) -> Result<String, StatementError> {
        serde_json::from_str::<StatementRequest>(body)
            .unwrap()
            .into_statement()
    }

    #[test]
    fn statement_validation() {
        assert_eq!(parse(r#"{"statement": "SELECT 1"}"#).unwrap(), "SELECT 1");
        assert_eq!(
            parse(r#"{"statement": " SELECT 1;\n", "extra": true}"#).unwrap(),
            " SELECT 1;\n"
        );
        for body in [r#"{}"#, r#"{"statement": null}"#, r#"{"sql": "SELECT 1"}"#] {
            match parse(body) {
                Err(StatementError::Validation(msg)) => {
                    assert_eq!(msg, "No statement field in body")
                }
                other => panic!("{body}: expected validation error, got {other:?}"),
            }
        }
        for body in [r#"{"statement": ""}"#, r#"{"statement": " \n\t"}"#] {
            match parse(body) {
                Err(StatementError::Validation(msg)) => {
                    assert_eq!(msg, "statement must not be empty")
                }
                other => panic!("{body}: expected validation error, got {other:?}"),
            }
        }
    }

    #[test]
    fn non_string_statement_is_rejected() {
        assert!(serde_json::from_str::<StatementRequest>(r#"{"statement": 1}"#).is_err());
    }
}
