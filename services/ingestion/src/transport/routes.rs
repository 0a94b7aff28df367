use std::collections::HashMap;

use registry::RegistryError;
use schema::CheckpointId;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    HttpRequest, HttpResponse,
    request::{
        parse_json_body, parse_query_i64, parse_query_positive_ms, parse_query_u64,
        parse_query_usize, path_segments, presented_admin_token, split_target,
    },
};
use crate::{
    api::{
        BatchSubmitRequest, CheckpointEventsResponse, PurgeRequest, SubjectEventsResponse,
    },
    gate::GateError,
    runtime::{DEFAULT_PAGE_LIMIT, IngestionRuntime},
};

const STATIC_ROUTES: &[&str] = &[
    "/health",
    "/metrics",
    "/v1/scans",
    "/v1/scans/batch",
    "/v1/events",
    "/v1/subjects/resolve",
    "/v1/at-risk",
    "/v1/at-risk/last-sweep",
    "/v1/admin/purge",
];

pub fn handle_request(runtime: &IngestionRuntime, request: &HttpRequest) -> HttpResponse {
    let (path, query) = split_target(&request.target);
    match (request.method.as_str(), path.as_str()) {
        ("GET", "/health") => HttpResponse::ok_json(&json!({
            "status": "ok",
            "events": runtime.events_len(),
        })),
        ("GET", "/metrics") => {
            runtime.flush_wal_if_due();
            HttpResponse::ok_text(runtime.metrics_text())
        }
        ("POST", "/v1/scans") => submit_scan(runtime, request),
        ("POST", "/v1/scans/batch") => submit_batch(runtime, request),
        ("GET", "/v1/events") => events_after(runtime, &query),
        // Matched before the `/v1/subjects/{id}` family below.
        ("GET", "/v1/subjects/resolve") => resolve_subject(runtime, &query),
        ("GET", "/v1/at-risk") => at_risk(runtime, &query),
        ("GET", "/v1/at-risk/last-sweep") => match runtime.last_sweep() {
            Some(report) => HttpResponse::ok_json(&report),
            None => HttpResponse::not_found("no sweep has run yet"),
        },
        ("POST", "/v1/admin/purge") => purge(runtime, request),
        ("GET", subject_path) if subject_path.starts_with("/v1/subjects/") => {
            subject_route(runtime, subject_path)
        }
        ("GET", checkpoint_path) if checkpoint_path.starts_with("/v1/checkpoints/") => {
            checkpoint_route(runtime, checkpoint_path, &query)
        }
        (_, known) if STATIC_ROUTES.contains(&known) => {
            HttpResponse::method_not_allowed(&format!("method {} not allowed", request.method))
        }
        _ => HttpResponse::not_found("route not found"),
    }
}

pub(crate) fn map_gate_error(error: &GateError) -> (u16, String) {
    let status = match error {
        GateError::Validation(_) => 400,
        GateError::Conflict(_) => 409,
        GateError::Storage(_) | GateError::Unavailable => 503,
    };
    (status, error.to_string())
}

pub(crate) fn map_registry_error(error: &RegistryError) -> (u16, String) {
    let status = match error {
        RegistryError::SubjectNotFound(_) => 404,
        _ => 500,
    };
    (status, error.to_string())
}

fn gate_error_response(error: &GateError) -> HttpResponse {
    let (status, message) = map_gate_error(error);
    HttpResponse::error_with_status(status, &message)
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

fn submit_scan(runtime: &IngestionRuntime, request: &HttpRequest) -> HttpResponse {
    let submission = match parse_json_body(request, "POST /v1/scans") {
        Ok(submission) => submission,
        Err(err) => return HttpResponse::bad_request(&err),
    };
    match runtime.submit_scan(&submission) {
        Ok(outcome) => HttpResponse::ok_json(&outcome),
        Err(err) => gate_error_response(&err),
    }
}

fn submit_batch(runtime: &IngestionRuntime, request: &HttpRequest) -> HttpResponse {
    let batch: BatchSubmitRequest = match parse_json_body(request, "POST /v1/scans/batch") {
        Ok(batch) => batch,
        Err(err) => return HttpResponse::bad_request(&err),
    };
    if batch.events.len() > runtime.max_batch_items() {
        return HttpResponse::payload_too_large(&format!(
            "batch of {} events exceeds the limit of {}",
            batch.events.len(),
            runtime.max_batch_items()
        ));
    }
    HttpResponse::ok_json(&runtime.submit_batch(&batch))
}

fn purge(runtime: &IngestionRuntime, request: &HttpRequest) -> HttpResponse {
    let Some(expected) = runtime.admin_token() else {
        return HttpResponse::forbidden("admin operations are disabled");
    };
    if presented_admin_token(request) != Some(expected) {
        warn!("admin purge rejected: bad or missing token");
        return HttpResponse::unauthorized("admin token required");
    }
    let purge: PurgeRequest = match parse_json_body(request, "POST /v1/admin/purge") {
        Ok(purge) => purge,
        Err(err) => return HttpResponse::bad_request(&err),
    };
    match runtime.purge(&purge.event_id) {
        Ok(response) => {
            info!(event_id = %response.event_id, purged = response.purged, "admin purge");
            HttpResponse::ok_json(&response)
        }
        Err(err) => gate_error_response(&err),
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

fn events_after(runtime: &IngestionRuntime, query: &HashMap<String, String>) -> HttpResponse {
    let after_seq = match parse_query_u64(query, "after_seq") {
        Ok(value) => value.unwrap_or(0),
        Err(err) => return HttpResponse::bad_request(&err),
    };
    let limit = match parse_query_usize(query, "limit") {
        Ok(value) => value.unwrap_or(DEFAULT_PAGE_LIMIT),
        Err(err) => return HttpResponse::bad_request(&err),
    };
    match runtime.events_after(after_seq, limit) {
        Ok(page) => HttpResponse::ok_json(&page),
        Err(err) => gate_error_response(&err),
    }
}

fn resolve_subject(runtime: &IngestionRuntime, query: &HashMap<String, String>) -> HttpResponse {
    let token = match query.get("token").map(|token| token.trim()) {
        Some(token) if !token.is_empty() => token,
        _ => return HttpResponse::bad_request("query parameter 'token' is required"),
    };
    match runtime.resolve_subject(token) {
        Ok(subject) => HttpResponse::ok_json(&subject),
        Err(err) => {
            let (status, message) = map_registry_error(&err);
            HttpResponse::error_with_status(status, &message)
        }
    }
}

fn at_risk(runtime: &IngestionRuntime, query: &HashMap<String, String>) -> HttpResponse {
    let mut thresholds = runtime.at_risk_thresholds();
    match parse_query_positive_ms(query, "transit_threshold_ms") {
        Ok(Some(value)) => thresholds.transit_threshold_ms = value,
        Ok(None) => {}
        Err(err) => return HttpResponse::bad_request(&err),
    }
    match parse_query_positive_ms(query, "inactivity_threshold_ms") {
        Ok(Some(value)) => thresholds.inactivity_threshold_ms = value,
        Ok(None) => {}
        Err(err) => return HttpResponse::bad_request(&err),
    }
    match parse_query_usize(query, "daily_lap_target") {
        Ok(Some(value)) => match u32::try_from(value) {
            Ok(value) => thresholds.daily_lap_target = value,
            Err(_) => return HttpResponse::bad_request("daily_lap_target is too large"),
        },
        Ok(None) => {}
        Err(err) => return HttpResponse::bad_request(&err),
    }
    if let Err(err) = thresholds.validate() {
        return HttpResponse::bad_request(&err.to_string());
    }
    HttpResponse::ok_json(&runtime.at_risk(&thresholds))
}

fn subject_route(runtime: &IngestionRuntime, path: &str) -> HttpResponse {
    let Some(segments) = path_segments(path, "/v1/subjects/") else {
        return HttpResponse::not_found("route not found");
    };
    let (raw_id, action) = match segments.as_slice() {
        [raw_id, action] => (*raw_id, *action),
        _ => return HttpResponse::not_found("route not found"),
    };
    let subject_id = match Uuid::parse_str(raw_id) {
        Ok(subject_id) => subject_id,
        Err(_) => return HttpResponse::bad_request("subject id must be a UUID"),
    };
    match action {
        "events" => match runtime.subject_events(&subject_id) {
            Ok(events) => HttpResponse::ok_json(&SubjectEventsResponse { subject_id, events }),
            Err(err) => gate_error_response(&err),
        },
        "stats" => HttpResponse::ok_json(&runtime.subject_stats(&subject_id)),
        _ => HttpResponse::not_found("route not found"),
    }
}

fn checkpoint_route(
    runtime: &IngestionRuntime,
    path: &str,
    query: &HashMap<String, String>,
) -> HttpResponse {
    let raw_id = match path_segments(path, "/v1/checkpoints/").as_deref() {
        Some([raw_id, "events"]) => raw_id.to_string(),
        _ => return HttpResponse::not_found("route not found"),
    };
    let checkpoint_id = match raw_id.parse::<CheckpointId>() {
        Ok(checkpoint_id) => checkpoint_id,
        Err(_) => return HttpResponse::bad_request("checkpoint id must be a small integer"),
    };
    let since = match parse_query_i64(query, "since") {
        Ok(since) => since,
        Err(err) => return HttpResponse::bad_request(&err),
    };
    match runtime.checkpoint_events(checkpoint_id, since) {
        Ok(events) => HttpResponse::ok_json(&CheckpointEventsResponse {
            checkpoint_id,
            since,
            events,
        }),
        Err(err) => gate_error_response(&err),
    }
}
