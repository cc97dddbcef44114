use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::http::{AppState, ErrorBody};

/// Compare without short-circuiting on the first differing byte.
fn token_matches(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Rejects requests without `Authorization: Bearer <api token>`.
pub async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let verdict = match bearer_token(&req) {
        Some(token) if token_matches(token, &state.api_token) => None,
        Some(_) => Some("wrong"),
        None => Some("missing"),
    };
    match verdict {
        None => next.run(req).await,
        Some(problem) => {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::debug!("rejecting {} {}: {problem} token", req.method(), req.uri().path());
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                axum::Json(ErrorBody {
                    code: "UNAUTHENTICATED",
                    message: "missing or invalid bearer token".into(),
                }),
            )
                .into_response()
        }
    }
}
