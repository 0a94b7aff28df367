use std::{collections::HashMap, future::Future};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, Request, Response, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::any,
};
use tokio::net::TcpListener;
use tracing::debug;

use crate::{
    runtime::SharedRuntime,
    transport::{HttpRequest, HttpResponse, MAX_HTTP_BODY_BYTES, handle_request},
};

#[derive(Clone)]
struct AppState {
    runtime: SharedRuntime,
}

pub fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .fallback(any(dispatch))
        .with_state(AppState { runtime })
        .layer(DefaultBodyLimit::max(MAX_HTTP_BODY_BYTES))
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
pub async fn serve(
    listener: TcpListener,
    runtime: SharedRuntime,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> impl IntoResponse {
    let method = request.method().to_string();
    let target = request
        .uri()
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }

    let body = match to_bytes(request.into_body(), MAX_HTTP_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            return response_from_transport(HttpResponse::bad_request(&format!(
                "request body error: {err}"
            )));
        }
    };

    let request = HttpRequest {
        method,
        target,
        headers,
        body,
    };
    let response = handle_request(&state.runtime, &request);
    debug!(
        method = %request.method,
        target = %request.target,
        status = response.status,
        "handled request"
    );
    response_from_transport(response)
}

fn response_from_transport(response: HttpResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    out.headers_mut().insert(
        CONTENT_TYPE,
        response
            .content_type
            .parse()
            .unwrap_or(HeaderValue::from_static("application/json")),
    );
    out
}
