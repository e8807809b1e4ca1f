//! HTTP metrics middleware.
//!
//! Records every response, including framework-level rejections that never
//! reach a handler (404, 405, 415, timeouts).

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::observability::metrics::record_http_request;

/// Record method, normalized path, status and duration of each request.
///
/// Applied as the outermost layer.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed());
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::post,
        Router,
    };
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use tower::ServiceExt;

    async fn handler_204() -> StatusCode {
        StatusCode::NO_CONTENT
    }

    fn test_app() -> Router {
        Router::new()
            .route("/v1/sessions/:id/heartbeat", post(handler_204))
            .layer(middleware::from_fn(http_metrics_middleware))
    }

    fn request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .expect("request builder should succeed")
    }

    #[tokio::test]
    async fn test_middleware_passes_response_through() {
        let response = test_app()
            .oneshot(request("/v1/sessions/abc/heartbeat"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = test_app().oneshot(request("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_middleware_records_normalized_endpoint() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                test_app()
                    .oneshot(request("/v1/sessions/abc/heartbeat"))
                    .await
                    .unwrap();
            });
        });

        let count = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| {
                key.key().name() == "sc_http_requests_total"
                    && key
                        .key()
                        .labels()
                        .any(|l| l.key() == "endpoint" && l.value() == "/v1/sessions/{id}/heartbeat")
            })
            .map(|(_, _, _, value)| value);

        assert_eq!(count, Some(DebugValue::Counter(1)));
    }
}
