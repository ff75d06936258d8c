// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Health check and metrics endpoints.

use axum::extract::State;
use axum::response::IntoResponse;
use http::StatusCode;

use crate::http::GatewayState;

pub async fn handle_liveness_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Reports ready until the gateway begins shutting down.
pub async fn handle_readiness_check(State(state): State<GatewayState>) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ready")
    }
}

pub async fn handle_prometheus(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            text,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to render metrics: {e}"),
        )
            .into_response(),
    }
}
