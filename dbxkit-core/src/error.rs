use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Header carrying the server-side request id, used to decorate error messages.
pub const REQUEST_ID_HEADER: &str = "X-Dropbox-Request-Id";

/// OAuth 2 error codes returned by the token endpoint, plus local failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuth2Error {
    UnauthorizedClient,
    AccessDenied,
    UnsupportedResponseType,
    InvalidScope,
    ServerError,
    TemporarilyUnavailable,
    InvalidRequest,
    InvalidClient,
    /// The refresh token was revoked or is otherwise no longer valid.
    InvalidGrant,
    UnsupportedGrantType,
    InconsistentState,
    /// The refresh request did not complete in time.
    Timeout,
    /// The refresh request failed below HTTP (DNS, TLS, connection reset).
    Network,
    Unknown,
}

impl OAuth2Error {
    /// Map an `error` field from a token endpoint response.
    pub fn from_code(code: &str) -> Self {
        match code {
            "unauthorized_client" => OAuth2Error::UnauthorizedClient,
            "access_denied" => OAuth2Error::AccessDenied,
            "unsupported_response_type" => OAuth2Error::UnsupportedResponseType,
            "invalid_scope" => OAuth2Error::InvalidScope,
            "server_error" => OAuth2Error::ServerError,
            "temporarily_unavailable" => OAuth2Error::TemporarilyUnavailable,
            "invalid_request" => OAuth2Error::InvalidRequest,
            "invalid_client" => OAuth2Error::InvalidClient,
            "invalid_grant" => OAuth2Error::InvalidGrant,
            "unsupported_grant_type" => OAuth2Error::UnsupportedGrantType,
            "inconsistent_state" => OAuth2Error::InconsistentState,
            _ => OAuth2Error::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OAuth2Error::UnauthorizedClient => "unauthorized_client",
            OAuth2Error::AccessDenied => "access_denied",
            OAuth2Error::UnsupportedResponseType => "unsupported_response_type",
            OAuth2Error::InvalidScope => "invalid_scope",
            OAuth2Error::ServerError => "server_error",
            OAuth2Error::TemporarilyUnavailable => "temporarily_unavailable",
            OAuth2Error::InvalidRequest => "invalid_request",
            OAuth2Error::InvalidClient => "invalid_client",
            OAuth2Error::InvalidGrant => "invalid_grant",
            OAuth2Error::UnsupportedGrantType => "unsupported_grant_type",
            OAuth2Error::InconsistentState => "inconsistent_state",
            OAuth2Error::Timeout => "timeout",
            OAuth2Error::Network => "network",
            OAuth2Error::Unknown => "unknown",
        }
    }

    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, OAuth2Error::InvalidGrant)
    }
}

impl fmt::Display for OAuth2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed token refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRefreshError {
    pub error: OAuth2Error,
    pub description: Option<String>,
}

impl AuthRefreshError {
    pub fn new(error: OAuth2Error, description: Option<String>) -> Self {
        Self { error, description }
    }

    pub fn timeout(description: impl Into<String>) -> Self {
        Self::new(OAuth2Error::Timeout, Some(description.into()))
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new(OAuth2Error::InvalidGrant, Some(description.into()))
    }

    /// Revoked credentials; every other failure is considered transient.
    pub fn is_invalid_grant(&self) -> bool {
        self.error.is_invalid_grant()
    }
}

impl fmt::Display for AuthRefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token refresh failed ({})", self.error)?;
        if let Some(d) = &self.description {
            write!(f, ": {}", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for AuthRefreshError {}

/// Failures reported by the network stack, surfaced verbatim to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Request cancelled")]
    Cancelled,
    #[error("Request timed out")]
    TimedOut,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Session invalidated")]
    SessionInvalidated,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Failures moving or reading a completed download.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilesAccessError {
    #[error("Could not move download to temporary location: {0}")]
    MovingToTempLocation(String),
    #[error("Could not move download from temporary location: {0}")]
    MovingFromTempLocation(String),
    #[error("Destination already exists: {}", .0.display())]
    DestinationCollision(PathBuf),
    #[error("Could not read error data: {0}")]
    ReadingErrorData(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconnectionErrorKind {
    /// The task carries no persisted description.
    NoPersistedInfo,
    /// The description was written by a different schema version.
    VersionMismatch,
    /// The description is not `<version><separator><json>` or the JSON is malformed.
    BadPersistedStringFormat,
    /// The described route is not known to this build.
    MissingReconnectionCase,
    Unknown,
}

impl fmt::Display for ReconnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconnectionErrorKind::NoPersistedInfo => "no persisted info",
            ReconnectionErrorKind::VersionMismatch => "version mismatch",
            ReconnectionErrorKind::BadPersistedStringFormat => "bad persisted string format",
            ReconnectionErrorKind::MissingReconnectionCase => "missing reconnection case",
            ReconnectionErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Reconnection failed: {kind}")]
pub struct ReconnectionError {
    pub kind: ReconnectionErrorKind,
    /// The raw persisted description, when the task had one.
    pub task_description: Option<String>,
}

impl ReconnectionError {
    pub fn new(kind: ReconnectionErrorKind, task_description: Option<String>) -> Self {
        Self {
            kind,
            task_description,
        }
    }
}

/// Errors produced by the client itself rather than by the API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("OAuth error: {0}")]
    OauthError(AuthRefreshError),
    #[error("Transport error: {0}")]
    TransportError(TransportError),
    #[error("File access error: {0}")]
    FileAccessError(FilesAccessError),
    #[error("Request object was deallocated before its response was handled")]
    RequestObjectDeallocated,
    #[error("Request finished in an unexpected state")]
    UnexpectedState,
    /// The transport reported a successful status and an error for the same task.
    #[error("Transport reported status {status} together with error: {error}")]
    ConflictingCompletion { status: u16, error: TransportError },
    #[error("Session has been shut down")]
    SessionShutdown,
    #[error("Could not serialize route arguments: {0}")]
    ArgumentSerialization(String),
}

impl From<AuthRefreshError> for ClientError {
    fn from(err: AuthRefreshError) -> Self {
        ClientError::OauthError(err)
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        ClientError::TransportError(err)
    }
}

impl From<FilesAccessError> for ClientError {
    fn from(err: FilesAccessError) -> Self {
        ClientError::FileAccessError(err)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedUserMessage {
    pub text: String,
    pub locale: String,
}

/// Structured error body returned by the API for 401/403/409/429 responses.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiErrorDetails<T> {
    pub error: T,
    pub user_message: Option<LocalizedUserMessage>,
    pub error_summary: Option<String>,
    pub request_id: Option<String>,
}

/// The single error type handed to response handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError<E> {
    InternalServerError {
        code: u16,
        message: Option<String>,
        request_id: Option<String>,
    },
    BadInputError {
        message: Option<String>,
        request_id: Option<String>,
    },
    RateLimitError(ApiErrorDetails<Value>),
    HttpError {
        code: Option<u16>,
        message: Option<String>,
        request_id: Option<String>,
    },
    AuthError(ApiErrorDetails<Value>),
    AccessError(ApiErrorDetails<Value>),
    RouteError(ApiErrorDetails<E>),
    SerializationError(String),
    ReconnectionError(ReconnectionError),
    ClientError(ClientError),
}

impl<E: DeserializeOwned> CallError<E> {
    /// Map a non-2xx response to the matching error case.
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let request_id = request_id(headers);
        let code = status.as_u16();

        match code {
            500..=599 => CallError::InternalServerError {
                code,
                message: Some(String::from_utf8_lossy(body).into_owned()),
                request_id,
            },
            400 => CallError::BadInputError {
                message: Some(String::from_utf8_lossy(body).into_owned()),
                request_id,
            },
            401 => match details::<Value, E>(body, request_id) {
                Ok(details) => CallError::AuthError(details),
                Err(e) => e,
            },
            403 => match details::<Value, E>(body, request_id) {
                Ok(details) => CallError::AccessError(details),
                Err(e) => e,
            },
            409 => match details::<E, E>(body, request_id) {
                Ok(details) => CallError::RouteError(details),
                Err(e) => e,
            },
            429 => match details::<Value, E>(body, request_id) {
                Ok(details) => CallError::RateLimitError(details),
                Err(e) => e,
            },
            _ => CallError::HttpError {
                code: Some(code),
                message: Some("An error occurred.".to_string()),
                request_id,
            },
        }
    }
}

impl<E> CallError<E> {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            CallError::InternalServerError { request_id, .. }
            | CallError::BadInputError { request_id, .. }
            | CallError::HttpError { request_id, .. } => request_id.as_deref(),
            CallError::RateLimitError(d) | CallError::AuthError(d) | CallError::AccessError(d) => {
                d.request_id.as_deref()
            }
            CallError::RouteError(d) => d.request_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, CallError::AuthError(_))
    }

    /// A copy with the route-specific payload turned into JSON by
    /// `route_error`, for observers that see every route.
    pub fn erased(&self, route_error: impl FnOnce(&E) -> Value) -> CallError<Value> {
        match self {
            CallError::InternalServerError {
                code,
                message,
                request_id,
            } => CallError::InternalServerError {
                code: *code,
                message: message.clone(),
                request_id: request_id.clone(),
            },
            CallError::BadInputError { message, request_id } => CallError::BadInputError {
                message: message.clone(),
                request_id: request_id.clone(),
            },
            CallError::RateLimitError(d) => CallError::RateLimitError(d.clone()),
            CallError::HttpError {
                code,
                message,
                request_id,
            } => CallError::HttpError {
                code: *code,
                message: message.clone(),
                request_id: request_id.clone(),
            },
            CallError::AuthError(d) => CallError::AuthError(d.clone()),
            CallError::AccessError(d) => CallError::AccessError(d.clone()),
            CallError::RouteError(d) => CallError::RouteError(ApiErrorDetails {
                error: route_error(&d.error),
                user_message: d.user_message.clone(),
                error_summary: d.error_summary.clone(),
                request_id: d.request_id.clone(),
            }),
            CallError::SerializationError(e) => CallError::SerializationError(e.clone()),
            CallError::ReconnectionError(e) => CallError::ReconnectionError(e.clone()),
            CallError::ClientError(e) => CallError::ClientError(e.clone()),
        }
    }
}

impl<E> From<ClientError> for CallError<E> {
    fn from(err: ClientError) -> Self {
        CallError::ClientError(err)
    }
}

impl<E> From<ReconnectionError> for CallError<E> {
    fn from(err: ReconnectionError) -> Self {
        CallError::ReconnectionError(err)
    }
}

impl<E: fmt::Debug> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(r) = self.request_id() {
            write!(f, "[request-id {}] ", r)?;
        }
        match self {
            CallError::InternalServerError { code, message, .. } => {
                write!(f, "Internal Server Error {}", code)?;
                if let Some(m) = message {
                    write!(f, ": {}", m)?;
                }
                Ok(())
            }
            CallError::BadInputError { message, .. } => {
                write!(f, "Bad Input")?;
                if let Some(m) = message {
                    write!(f, ": {}", m)?;
                }
                Ok(())
            }
            CallError::AuthError(d) => write!(f, "API auth error - {}", d.error),
            CallError::AccessError(d) => write!(f, "API access error - {}", d.error),
            CallError::HttpError { code, message, .. } => {
                write!(f, "HTTP Error")?;
                if let Some(c) = code {
                    write!(f, " {}", c)?;
                }
                if let Some(m) = message {
                    write!(f, ": {}", m)?;
                }
                Ok(())
            }
            CallError::RouteError(d) => write!(f, "API route error - {:?}", d.error),
            CallError::RateLimitError(d) => write!(f, "API rate limit error - {}", d.error),
            CallError::SerializationError(e) => write!(f, "{}", e),
            CallError::ReconnectionError(e) => write!(f, "{}", e),
            CallError::ClientError(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug> std::error::Error for CallError<E> {}

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[derive(Deserialize)]
struct ErrorEnvelope<T> {
    error: T,
    user_message: Option<LocalizedUserMessage>,
    error_summary: Option<String>,
}

fn details<T: DeserializeOwned, E>(
    body: &[u8],
    request_id: Option<String>,
) -> Result<ApiErrorDetails<T>, CallError<E>> {
    let envelope: ErrorEnvelope<T> = serde_json::from_slice(body)
        .map_err(|e| CallError::SerializationError(format!("Could not decode error body: {}", e)))?;
    Ok(ApiErrorDetails {
        error: envelope.error,
        user_message: envelope.user_message,
        error_summary: envelope.error_summary,
        request_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde_json::json;

    fn headers_with_request_id(id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_str(id).unwrap());
        headers
    }

    #[test]
    fn test_invalid_grant_is_distinguished() {
        assert!(AuthRefreshError::invalid_grant("revoked").is_invalid_grant());
        assert!(!AuthRefreshError::timeout("slow").is_invalid_grant());
        assert_eq!(OAuth2Error::from_code("invalid_grant"), OAuth2Error::InvalidGrant);
        assert_eq!(OAuth2Error::from_code("something_else"), OAuth2Error::Unknown);
    }

    #[test]
    fn test_auth_refresh_error_display() {
        let err = AuthRefreshError::timeout("took too long");
        assert_eq!(err.to_string(), "token refresh failed (timeout): took too long");

        let err = AuthRefreshError::new(OAuth2Error::ServerError, None);
        assert_eq!(err.to_string(), "token refresh failed (server_error)");
    }

    #[test]
    fn test_server_error_mapping() {
        let err: CallError<Value> = CallError::from_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &headers_with_request_id("abc"),
            b"down",
        );
        assert!(matches!(err, CallError::InternalServerError { code: 503, .. }));
        assert_eq!(err.request_id(), Some("abc"));
        assert_eq!(err.to_string(), "[request-id abc] Internal Server Error 503: down");
    }

    #[test]
    fn test_auth_error_mapping() {
        let body = json!({
            "error": {".tag": "expired_access_token"},
            "error_summary": "expired_access_token/",
            "user_message": {"text": "Sign in again", "locale": "en"}
        });
        let err: CallError<Value> = CallError::from_response(
            StatusCode::UNAUTHORIZED,
            &HeaderMap::new(),
            body.to_string().as_bytes(),
        );
        match err {
            CallError::AuthError(details) => {
                assert_eq!(details.error, json!({".tag": "expired_access_token"}));
                assert_eq!(details.error_summary.as_deref(), Some("expired_access_token/"));
                assert_eq!(details.user_message.unwrap().text, "Sign in again");
            }
            other => panic!("Expected auth error, got {:?}", other),
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct LookupError {
        #[serde(rename = ".tag")]
        tag: String,
    }

    #[test]
    fn test_route_error_is_typed() {
        let body = json!({"error": {".tag": "not_found"}, "error_summary": "path/not_found/"});
        let err: CallError<LookupError> = CallError::from_response(
            StatusCode::CONFLICT,
            &HeaderMap::new(),
            body.to_string().as_bytes(),
        );
        match err {
            CallError::RouteError(details) => assert_eq!(details.error.tag, "not_found"),
            other => panic!("Expected route error, got {:?}", other),
        }
    }

    #[test]
    fn test_erased_keeps_details_and_converts_route_payload() {
        let body = json!({"error": {".tag": "not_found"}, "error_summary": "path/not_found/"});
        let err: CallError<LookupError> = CallError::from_response(
            StatusCode::CONFLICT,
            &headers_with_request_id("r1"),
            body.to_string().as_bytes(),
        );
        match err.erased(|e| json!({".tag": e.tag})) {
            CallError::RouteError(details) => {
                assert_eq!(details.error, json!({".tag": "not_found"}));
                assert_eq!(details.error_summary.as_deref(), Some("path/not_found/"));
                assert_eq!(details.request_id.as_deref(), Some("r1"));
            }
            other => panic!("Expected route error, got {:?}", other),
        }

        let err: CallError<LookupError> = CallError::ClientError(ClientError::SessionShutdown);
        assert_eq!(
            err.erased(|_| Value::Null),
            CallError::ClientError(ClientError::SessionShutdown)
        );
    }

    #[test]
    fn test_undecodable_error_body_is_serialization_error() {
        let err: CallError<Value> =
            CallError::from_response(StatusCode::FORBIDDEN, &HeaderMap::new(), b"not json");
        assert!(matches!(err, CallError::SerializationError(_)));
    }

    #[test]
    fn test_other_status_is_http_error() {
        let err: CallError<Value> =
            CallError::from_response(StatusCode::IM_A_TEAPOT, &HeaderMap::new(), b"");
        assert!(matches!(err, CallError::HttpError { code: Some(418), .. }));
    }

    #[test]
    fn test_client_error_conversions() {
        let err: ClientError = TransportError::TimedOut.into();
        assert_eq!(err, ClientError::TransportError(TransportError::TimedOut));

        let call: CallError<Value> = ClientError::RequestObjectDeallocated.into();
        assert!(matches!(
            call,
            CallError::ClientError(ClientError::RequestObjectDeallocated)
        ));
    }
}
