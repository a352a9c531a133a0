use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, put};
use axum::{Json, Router};
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;
use urlinfo_contracts::{DeleteRequest, SetPathRequest};
use urlinfo_store::{MemoryRecordStore, PgRecordStore, RecordStore, StoreError};

use crate::config::{ServiceConfig, StartupError, StoreBackend};
use crate::service::{PolicyError, PolicyService};

const ADMIN_SECRET_HEADER: &str = "x-urlinfo-admin-secret";
const REQUEST_ID_HEADER: &str = "x-urlinfo-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: ServiceConfig,
    service: PolicyService,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: ServiceConfig) -> Result<Router, StartupError> {
    let store: Arc<dyn RecordStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryRecordStore::new()),
        StoreBackend::Postgres => {
            let db_url = config.db_url.as_deref().ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "missing required config key URLINFO_DB_URL".to_string(),
            })?;
            let store = PgRecordStore::connect_and_migrate(db_url, config.store_timeout())
                .await
                .map_err(|err| StartupError {
                    code: "ERR_STORE_UNAVAILABLE",
                    message: format!("failed to initialize record store: {}", err),
                })?;
            Arc::new(store)
        }
    };

    Ok(router_with_store(config, store))
}

pub fn router_with_store(config: ServiceConfig, store: Arc<dyn RecordStore>) -> Router {
    let service = PolicyService::new(
        store,
        config.store_timeout(),
        config.mutation_retry_max_attempts,
    );
    let state = AppState { config, service };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/urlinfo/1/{*request_url}", any(resolve_url))
        .route("/v1/domains", get(list_domains).post(create_domain))
        .route(
            "/v1/domains/{domain}",
            get(fetch_domain).delete(delete_domain),
        )
        .route(
            "/v1/domains/{domain}/policy",
            put(set_policy).delete(delete_policy),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = state.service.ping().await.is_ok();
    checks.insert("store", store_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.metrics_require_auth
        && let Err(err) =
            validate_admin_secret(&headers, state.config.admin_shared_secret.as_deref())
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ResolveResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

async fn resolve_url(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Path(request_url): Path<String>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Response {
    let target = parse_request_url(&request_url);
    let span = tracing::info_span!(
        "urlinfo.resolve",
        request_id = %extract_request_id(&headers),
        method = %method,
        domain = %target.domain,
        path = target.path.as_deref().unwrap_or(""),
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    observed("/urlinfo/1/{*request_url}", &method, span, async move {
        let Query(query) = query.map_err(|_| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_MALFORMED_REQUEST",
                "invalid query string".to_string(),
                false,
            )
        })?;

        if target.domain.is_empty() {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "ERR_MALFORMED_REQUEST",
                "request URL names no host".to_string(),
                false,
            ));
        }

        match state
            .service
            .resolve(&target.domain, target.path.as_deref(), &query)
            .await
        {
            Ok(_) => {
                crate::metrics::observe_verdict("safe");
                Ok::<_, ApiError>((
                    StatusCode::OK,
                    Json(ResolveResponse {
                        status: "success",
                        message: None,
                    }),
                )
                    .into_response())
            }
            Err(PolicyError::Blocked(blocked)) => {
                crate::metrics::observe_verdict("blocked");
                tracing::info!(path = %blocked.path, "urlinfo.blocked");
                Ok((
                    StatusCode::FORBIDDEN,
                    Json(ResolveResponse {
                        status: "fail",
                        message: Some(blocked.to_string()),
                    }),
                )
                    .into_response())
            }
            Err(err) => {
                crate::metrics::observe_verdict("error");
                Err(policy_error_response(&err))
            }
        }
    })
    .await
}

#[derive(Debug, Serialize)]
struct DomainListResponse {
    domains: Vec<String>,
}

async fn list_domains(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let span = admin_span(&headers, "list", "");
    observed("/v1/domains", &method, span, async move {
        validate_admin_secret(&headers, state.config.admin_shared_secret.as_deref())?;
        let domains = state
            .service
            .list_domains()
            .await
            .map_err(|err| policy_error_response(&err))?;
        Ok::<_, ApiError>(Json(DomainListResponse { domains }).into_response())
    })
    .await
}

#[derive(Debug, Serialize)]
struct CreatedResponse {
    domain: String,
}

async fn create_domain(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let span = admin_span(&headers, "create", "");
    observed("/v1/domains", &method, span, async move {
        validate_admin_secret(&headers, state.config.admin_shared_secret.as_deref())?;
        let Json(document) = body.map_err(|_| invalid_json_body())?;

        let domain = state
            .service
            .create_domain(document)
            .await
            .map_err(|err| policy_error_response(&err))?;
        tracing::Span::current().record("domain", domain.as_str());

        Ok::<_, ApiError>((StatusCode::CREATED, Json(CreatedResponse { domain })).into_response())
    })
    .await
}

async fn fetch_domain(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Response {
    let span = admin_span(&headers, "fetch", &domain);
    observed("/v1/domains/{domain}", &method, span, async move {
        validate_admin_secret(&headers, state.config.admin_shared_secret.as_deref())?;
        let record = state
            .service
            .fetch_domain(&domain)
            .await
            .map_err(|err| policy_error_response(&err))?;
        Ok::<_, ApiError>(Json(record).into_response())
    })
    .await
}

async fn delete_domain(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Response {
    let span = admin_span(&headers, "remove", &domain);
    observed("/v1/domains/{domain}", &method, span, async move {
        validate_admin_secret(&headers, state.config.admin_shared_secret.as_deref())?;
        state
            .service
            .delete_domain(&domain)
            .await
            .map_err(|err| policy_error_response(&err))?;
        Ok::<_, ApiError>(StatusCode::NO_CONTENT.into_response())
    })
    .await
}

#[derive(Debug, Serialize)]
struct SetPolicyResponse {
    updated: bool,
}

async fn set_policy(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Path(domain): Path<String>,
    body: Result<Json<SetPathRequest>, JsonRejection>,
) -> Response {
    let span = admin_span(&headers, "set", &domain);
    observed("/v1/domains/{domain}/policy", &method, span, async move {
        validate_admin_secret(&headers, state.config.admin_shared_secret.as_deref())?;
        let Json(request) = body.map_err(|_| invalid_json_body())?;

        let updated = state
            .service
            .set(&domain, request)
            .await
            .map_err(|err| policy_error_response(&err))?;
        Ok::<_, ApiError>(Json(SetPolicyResponse { updated }).into_response())
    })
    .await
}

#[derive(Debug, Serialize)]
struct DeletePolicyResponse {
    deleted: bool,
}

async fn delete_policy(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Path(domain): Path<String>,
    body: Result<Json<DeleteRequest>, JsonRejection>,
) -> Response {
    let span = admin_span(&headers, "delete", &domain);
    observed("/v1/domains/{domain}/policy", &method, span, async move {
        validate_admin_secret(&headers, state.config.admin_shared_secret.as_deref())?;
        let Json(request) = body.map_err(|_| invalid_json_body())?;

        let deleted = state
            .service
            .delete(&domain, request)
            .await
            .map_err(|err| policy_error_response(&err))?;
        Ok::<_, ApiError>(Json(DeletePolicyResponse { deleted }).into_response())
    })
    .await
}

fn admin_span(headers: &HeaderMap, operation: &'static str, domain: &str) -> tracing::Span {
    tracing::info_span!(
        "urlinfo.admin",
        request_id = %extract_request_id(headers),
        operation,
        domain = %domain,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    )
}

/// Runs a handler body inside `span`, then records latency, outcome and
/// request metrics for whatever response it produced.
async fn observed<F>(
    route: &'static str,
    method: &Method,
    span: tracing::Span,
    body: F,
) -> Response
where
    F: Future<Output = Result<Response, ApiError>>,
{
    let started = Instant::now();

    let response = async move {
        let response = match body.await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        tracing::Span::current().record("outcome", outcome_label(response.status()));
        response
    }
    .instrument(span)
    .await;

    crate::metrics::observe_http_request(
        route,
        method.as_str(),
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

fn outcome_label(status: StatusCode) -> &'static str {
    match status {
        s if s.is_success() => "ok",
        StatusCode::FORBIDDEN => "blocked",
        s if s.is_client_error() => "rejected",
        _ => "error",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestTarget {
    domain: String,
    path: Option<String>,
}

/// Splits the URL under inspection into its authority and path. A missing
/// scheme means `https`.
fn parse_request_url(raw: &str) -> RequestTarget {
    let rest = strip_scheme(raw, "https://")
        .or_else(|| strip_scheme(raw, "http://"))
        .unwrap_or(raw);

    let (authority, path) = match rest.find(['/', '?', '#']) {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let path = path.split(['?', '#']).next().unwrap_or("");

    let domain = match authority.rsplit_once('@') {
        Some((_, host)) => host,
        None => authority,
    };

    RequestTarget {
        domain: domain.to_string(),
        path: (!path.is_empty()).then(|| path.to_string()),
    }
}

fn strip_scheme<'a>(raw: &'a str, scheme: &str) -> Option<&'a str> {
    let head = raw.get(..scheme.len())?;
    head.eq_ignore_ascii_case(scheme)
        .then(|| &raw[scheme.len()..])
}

fn validate_admin_secret(
    headers: &HeaderMap,
    expected_secret: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Ok(());
    };

    let provided_secret = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing admin secret".to_string(),
                false,
            )
        })?;

    if provided_secret != expected_secret {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "invalid admin secret".to_string(),
            false,
        ));
    }

    Ok(())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

fn invalid_json_body() -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_MALFORMED_REQUEST",
        "invalid JSON body".to_string(),
        false,
    )
}

fn policy_error_response(err: &PolicyError) -> ApiError {
    match err {
        PolicyError::Blocked(blocked) => json_error(
            StatusCode::FORBIDDEN,
            "ERR_BLOCKED",
            blocked.to_string(),
            false,
        ),
        PolicyError::NotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "ERR_NOT_FOUND", err.to_string(), false)
        }
        PolicyError::Conflict(_) => {
            json_error(StatusCode::CONFLICT, "ERR_CONFLICT", err.to_string(), false)
        }
        PolicyError::Malformed(_) => json_error(
            StatusCode::BAD_REQUEST,
            "ERR_MALFORMED_REQUEST",
            err.to_string(),
            false,
        ),
        PolicyError::Store(StoreError::Timeout) => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "ERR_STORE_TIMEOUT",
            "record store timeout".to_string(),
            true,
        ),
        PolicyError::Store(StoreError::Sqlx(_)) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_STORE_UNAVAILABLE",
            "record store unavailable".to_string(),
            true,
        ),
        PolicyError::Codec(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_STORE_CORRUPT",
            "stored domain record is malformed".to_string(),
            false,
        ),
        PolicyError::Contended(_) => {
            json_error(StatusCode::CONFLICT, "ERR_CONTENDED", err.to_string(), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use urlinfo_contracts::BlockedError;

    fn target(domain: &str, path: Option<&str>) -> RequestTarget {
        RequestTarget {
            domain: domain.to_string(),
            path: path.map(|p| p.to_string()),
        }
    }

    #[test]
    fn request_url_without_scheme_uses_authority_as_domain() {
        assert_eq!(
            parse_request_url("www.example.com:443/c/en/us/index.html"),
            target("www.example.com:443", Some("/c/en/us/index.html"))
        );
        assert_eq!(
            parse_request_url("www.example.com"),
            target("www.example.com", None)
        );
        assert_eq!(
            parse_request_url("www.example.com/"),
            target("www.example.com", Some("/"))
        );
    }

    #[test]
    fn request_url_scheme_and_userinfo_are_stripped() {
        assert_eq!(
            parse_request_url("https://badguys.example.com:443/x"),
            target("badguys.example.com:443", Some("/x"))
        );
        assert_eq!(
            parse_request_url("HTTP://user:pw@host.example:80/a/b?x=1#frag"),
            target("host.example:80", Some("/a/b"))
        );
        assert_eq!(
            parse_request_url("httpbin.example/get"),
            target("httpbin.example", Some("/get"))
        );
    }

    #[test]
    fn request_id_is_sanitized() {
        assert_eq!(
            sanitize_request_id("req-1 <script>"),
            Some("req-1script".to_string())
        );
        assert_eq!(sanitize_request_id("!!!"), None);
        assert_eq!(sanitize_request_id(&"a".repeat(100)).map(|s| s.len()), Some(64));

        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc.123"));
        assert_eq!(extract_request_id(&headers), "abc.123");
        assert_eq!(extract_request_id(&HeaderMap::new()).len(), 26);
    }

    #[test]
    fn admin_secret_is_optional_until_configured() {
        assert!(validate_admin_secret(&HeaderMap::new(), None).is_ok());

        let (status, Json(body)) =
            validate_admin_secret(&HeaderMap::new(), Some("s3cret")).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.code, "ERR_AUTH_REQUIRED");

        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_SECRET_HEADER, HeaderValue::from_static("wrong"));
        let (_, Json(body)) = validate_admin_secret(&headers, Some("s3cret")).unwrap_err();
        assert_eq!(body.code, "ERR_AUTH_INVALID");

        headers.insert(ADMIN_SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(validate_admin_secret(&headers, Some("s3cret")).is_ok());
    }

    #[test]
    fn policy_errors_map_to_status_codes() {
        let cases = [
            (
                PolicyError::Blocked(BlockedError::new(Some("/x"))),
                StatusCode::FORBIDDEN,
                false,
            ),
            (
                PolicyError::NotFound("d".to_string()),
                StatusCode::NOT_FOUND,
                false,
            ),
            (
                PolicyError::Conflict("d".to_string()),
                StatusCode::CONFLICT,
                false,
            ),
            (
                PolicyError::Malformed("bad".to_string()),
                StatusCode::BAD_REQUEST,
                false,
            ),
            (
                PolicyError::Store(StoreError::Timeout),
                StatusCode::GATEWAY_TIMEOUT,
                true,
            ),
            (
                PolicyError::Contended("d".to_string()),
                StatusCode::CONFLICT,
                true,
            ),
        ];

        for (err, expected_status, expected_retryable) in cases {
            let (status, Json(body)) = policy_error_response(&err);
            assert_eq!(status, expected_status, "{}", err);
            assert_eq!(body.retryable, expected_retryable, "{}", err);
        }
    }

    #[test]
    fn outcome_labels_follow_status_class() {
        assert_eq!(outcome_label(StatusCode::CREATED), "ok");
        assert_eq!(outcome_label(StatusCode::FORBIDDEN), "blocked");
        assert_eq!(outcome_label(StatusCode::NOT_FOUND), "rejected");
        assert_eq!(outcome_label(StatusCode::GATEWAY_TIMEOUT), "error");
    }
}
