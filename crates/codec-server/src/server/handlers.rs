//! Axum request handlers for all service endpoints.

use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{CodecRequest, CodecResponse, ErrorResponse, StatsResponse};
use common::ServiceError;
use tracing::{error, warn};

use super::state::AppState;
use crate::keys::manager::KeyStats;

/// Error wrapper that renders a [`ServiceError`] as a JSON error response.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl<E: Into<ServiceError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        // Server-side detail (KMS error context etc.) stays in the logs.
        let message = if self.0.is_client_error() {
            warn!(code = self.0.code(), error = %self.0, "request rejected");
            self.0.to_string()
        } else {
            error!(code = self.0.code(), error = %self.0, "request failed");
            server_error_message(&self.0).to_owned()
        };
        (status, Json(ErrorResponse::new(self.0.code(), message))).into_response()
    }
}

fn server_error_message(err: &ServiceError) -> &'static str {
    match err {
        ServiceError::KeyGenerationFailed(_) => "failed to generate a data key",
        ServiceError::KeyDecryptionFailed(_) => "failed to decrypt the data key",
        ServiceError::InvalidKeyLength(_) => "key management service returned an invalid key",
        _ => "internal error",
    }
}

fn parse_request(req: Result<Json<CodecRequest>, JsonRejection>) -> Result<CodecRequest, ApiError> {
    req.map(|Json(body)| body)
        .map_err(|rejection| ApiError(ServiceError::MalformedRequest(rejection.body_text())))
}

/// `POST /encode`: encrypt every plain payload in the batch.
pub async fn encode(
    State(state): State<AppState>,
    req: Result<Json<CodecRequest>, JsonRejection>,
) -> Result<Json<CodecResponse>, ApiError> {
    let req = parse_request(req)?;
    let payloads = state.codec.encode(req.payloads).await?;
    Ok(Json(CodecResponse { payloads }))
}

/// `POST /decode`: decrypt every encrypted payload in the batch.
pub async fn decode(
    State(state): State<AppState>,
    req: Result<Json<CodecRequest>, JsonRejection>,
) -> Result<Json<CodecResponse>, ApiError> {
    let req = parse_request(req)?;
    let payloads = state.codec.decode(req.payloads).await?;
    Ok(Json(CodecResponse { payloads }))
}

/// `GET /stats`: key lifecycle snapshot.
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(stats_response(state.keys.stats().await))
}

/// An expired key reports a negative `current_key_expires_in`.
fn stats_response(stats: KeyStats) -> StatsResponse {
    let current = stats.current;
    StatsResponse {
        cached_keys_count: stats.cached_keys_count,
        current_key_age: current.map(|c| format_duration(c.age)),
        current_key_expires_in: current.map(|c| {
            if c.expired {
                format!("-{}", format_duration(c.overdue))
            } else {
                format_duration(c.expires_in)
            }
        }),
        current_key_expired: current.map(|c| c.expired),
        low_expiry_warning: current.map(|c| c.low_expiry_warning),
    }
}

/// `GET /health`: liveness check.
pub async fn health() -> &'static str {
    "OK"
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

/// Render a duration the way Go's `time.Duration` prints: `1h2m3.5s`,
/// `4m0s`, `12.25s`, `500ms`, `1.5µs` or `0s`.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    match nanos {
        0 => return "0s".into(),
        1..=999 => return format!("{nanos}ns"),
        1_000..=999_999 => return format!("{}µs", decimal(nanos, 1_000)),
        1_000_000..=999_999_999 => return format!("{}ms", decimal(nanos, 1_000_000)),
        _ => {}
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs / 60) % 60;
    let seconds = decimal(
        u128::from(total_secs % 60) * 1_000_000_000 + u128::from(d.subsec_nanos()),
        1_000_000_000,
    );

    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, m) => format!("{m}m{seconds}s"),
        (h, m) => format!("{h}h{m}m{seconds}s"),
    }
}

/// `value / unit` with trailing fractional zeroes trimmed.
fn decimal(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let width = unit.ilog10() as usize;
    let s = format!("{whole}.{frac:0width$}");
    s.trim_end_matches('0').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::manager::CurrentKeyStats;

    #[test]
    fn format_duration_shapes() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(12_250)), "12.25s");
        assert_eq!(format_duration(Duration::from_secs(240)), "4m0s");
        assert_eq!(format_duration(Duration::from_millis(3_723_500)), "1h2m3.5s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.5µs");
        assert_eq!(format_duration(Duration::from_nanos(42)), "42ns");
        assert_eq!(format_duration(Duration::new(90, 5_000_000)), "1m30.005s");
    }

    fn current(expired: bool) -> CurrentKeyStats {
        CurrentKeyStats {
            age: Duration::from_secs(3660),
            expires_in: if expired { Duration::ZERO } else { Duration::from_secs(60) },
            overdue: if expired { Duration::from_millis(60_500) } else { Duration::ZERO },
            expired,
            low_expiry_warning: true,
        }
    }

    #[test]
    fn stats_response_for_valid_key() {
        let resp = stats_response(KeyStats {
            cached_keys_count: 2,
            current: Some(current(false)),
        });
        assert_eq!(resp.cached_keys_count, 2);
        assert_eq!(resp.current_key_age.as_deref(), Some("1h1m0s"));
        assert_eq!(resp.current_key_expires_in.as_deref(), Some("1m0s"));
        assert_eq!(resp.current_key_expired, Some(false));
    }

    #[test]
    fn stats_response_for_expired_key_is_negative() {
        let resp = stats_response(KeyStats {
            cached_keys_count: 0,
            current: Some(current(true)),
        });
        assert_eq!(resp.current_key_expires_in.as_deref(), Some("-1m0.5s"));
        assert_eq!(resp.current_key_expired, Some(true));
    }

    #[test]
    fn stats_response_without_key_reports_only_count() {
        let resp = stats_response(KeyStats {
            cached_keys_count: 3,
            current: None,
        });
        assert_eq!(resp.cached_keys_count, 3);
        assert!(resp.current_key_age.is_none());
        assert!(resp.current_key_expires_in.is_none());
    }

    #[test]
    fn api_error_uses_service_status() {
        let resp = ApiError(ServiceError::MissingKeyMaterial("payload 0".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ApiError(ServiceError::KeyDecryptionFailed("kms down".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    async fn error_body(err: ServiceError) -> ErrorResponse {
        let resp = ApiError(err).into_response();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn server_errors_hide_kms_detail() {
        let body = error_body(ServiceError::KeyDecryptionFailed(
            "Decrypt: AccessDeniedException: User arn:aws:iam::111122223333:role/x".into(),
        ))
        .await;
        assert_eq!(body.code, "key_decryption_failed");
        assert_eq!(body.message, "failed to decrypt the data key");
        assert!(!body.message.contains("arn:aws"));
    }

    #[tokio::test]
    async fn client_errors_keep_their_message() {
        let body = error_body(ServiceError::MissingKeyMaterial(
            "payload 1 is encrypted but carries no encrypted_data_key".into(),
        ))
        .await;
        assert!(body.message.contains("encrypted_data_key"));
    }
}
