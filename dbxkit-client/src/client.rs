// Transport client
// Turns route metadata and arguments into HTTP requests and hands them to the
// session dispatcher, wrapping each result in a typed handle.

use crate::config::{BaseHosts, ClientConfig};
use crate::dispatcher::SessionDispatcher;
use crate::facade::{DownloadRequestFile, DownloadRequestMemory, RpcRequest, UploadRequest};
use crate::global_errors::GlobalErrorHandlers;
use crate::reconnection::{ReconnectParts, ReconnectionFailure, RouteTable};
use crate::request::{ApiRequest, RequestContext};
use bytes::Bytes;
use dbxkit_core::{
    AccessTokenProvider, AuthType, ClientError, Executor, FilesAccess, FilesAccessImpl,
    PersistedRequestInfo, ReconnectionCodec, Route, RouteAttributes, RouteStyle, SerialQueue,
};
use dbxkit_transport::{HttpRequest, HttpSession, HttpSessionConfig, NetworkSession, UploadBody};
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, warn};

pub const DEFAULT_USER_AGENT: &str = concat!("OfficialDbxkitRustSDKv2/", env!("CARGO_PKG_VERSION"));

pub const API_ARG_HEADER: HeaderName = HeaderName::from_static("dropbox-api-arg");
pub const SELECT_USER_HEADER: HeaderName = HeaderName::from_static("dropbox-api-select-user");
pub const PATH_ROOT_HEADER: HeaderName = HeaderName::from_static("dropbox-api-path-root");

#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("HTTP client error: {0}")]
    Http(String),
    #[error("Files access error: {0}")]
    Files(#[from] dbxkit_core::FilesAccessError),
    #[error("Could not start executor: {0}")]
    Executor(#[from] std::io::Error),
}

/// Escape every non-ASCII UTF-16 unit as `\uXXXX` so the JSON fits in a header.
pub fn ascii_escape(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// The header-building half of the client, cheap to move into task factories.
#[derive(Clone)]
struct RequestBuilder {
    hosts: BaseHosts,
    user_agent: String,
    select_user: Option<String>,
    path_root: Option<String>,
    app_auth_header: Option<String>,
    provider: Arc<dyn AccessTokenProvider>,
}

impl RequestBuilder {
    /// Runs after the credential refresh, so the token read here is current.
    fn build(&self, attributes: RouteAttributes, url: &str, serialized_args: &str) -> HttpRequest {
        let mut request = HttpRequest::post(url);
        let headers = &mut request.headers;
        insert(headers, USER_AGENT, &self.user_agent);

        if !attributes.requires(AuthType::NoAuth) {
            if let Some(select_user) = &self.select_user {
                insert(headers, SELECT_USER_HEADER, select_user);
            }
            if let Some(path_root) = &self.path_root {
                insert(headers, PATH_ROOT_HEADER, path_root);
            }
            if attributes.requires(AuthType::User) || attributes.requires(AuthType::Team) {
                let bearer = format!("Bearer {}", self.provider.access_token());
                insert(headers, AUTHORIZATION, &bearer);
            } else if attributes.requires(AuthType::App) {
                if let Some(app_auth) = &self.app_auth_header {
                    insert(headers, AUTHORIZATION, app_auth);
                }
            }
        }

        match attributes.style {
            RouteStyle::Rpc => {
                insert(headers, CONTENT_TYPE, "application/json");
                request.body = Some(Bytes::copy_from_slice(serialized_args.as_bytes()));
            }
            RouteStyle::Upload => {
                insert(headers, CONTENT_TYPE, "application/octet-stream");
                insert(headers, API_ARG_HEADER, &ascii_escape(serialized_args));
            }
            RouteStyle::Download => {
                insert(headers, API_ARG_HEADER, &ascii_escape(serialized_args));
            }
        }
        request
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "Skipping header with invalid value"),
    }
}

pub struct TransportClient {
    config: ClientConfig,
    builder: RequestBuilder,
    dispatcher: Arc<SessionDispatcher>,
    files: Arc<dyn FilesAccess>,
    default_executor: Arc<dyn Executor>,
    codec: ReconnectionCodec,
    error_handlers: Arc<GlobalErrorHandlers>,
}

impl TransportClient {
    /// Wire a client around an existing dispatcher. The token provider and
    /// files access are the dispatcher's.
    pub fn new(config: ClientConfig, dispatcher: Arc<SessionDispatcher>, default_executor: Arc<dyn Executor>) -> Self {
        let user_agent = match &config.user_agent {
            Some(custom) => format!("{}/{}", custom, DEFAULT_USER_AGENT),
            None => DEFAULT_USER_AGENT.to_string(),
        };
        let ctx = dispatcher.context();
        let builder = RequestBuilder {
            hosts: config.hosts.clone(),
            user_agent,
            select_user: config.select_user.clone(),
            path_root: config.path_root.clone(),
            app_auth_header: None,
            provider: Arc::clone(&ctx.provider),
        };
        let files = Arc::clone(&ctx.files);
        let codec = ReconnectionCodec::new(config.schema_version.clone());
        Self {
            config,
            builder,
            dispatcher,
            files,
            default_executor,
            codec,
            error_handlers: Arc::new(GlobalErrorHandlers::new()),
        }
    }

    /// A client over a reqwest session on `handle`, with handlers delivered on
    /// a dedicated serial thread.
    pub fn with_http_session(
        config: ClientConfig,
        provider: Arc<dyn AccessTokenProvider>,
        handle: Handle,
    ) -> Result<Self, ClientBuildError> {
        let files: Arc<dyn FilesAccess> = Arc::new(FilesAccessImpl::new()?);
        let session_config = HttpSessionConfig {
            identifier: config.session_identifier.clone(),
            timeout: config.timeout,
            download_dir: config.download_dir.clone().unwrap_or_else(std::env::temp_dir),
        };
        let http_client =
            HttpSession::build_client(&session_config).map_err(|e| ClientBuildError::Http(e.to_string()))?;
        let ctx = RequestContext {
            provider,
            files,
            utility: handle.clone(),
        };
        let dispatcher = SessionDispatcher::new(ctx, move |delegate| {
            Arc::new(HttpSession::with_client(http_client, session_config, handle, delegate)) as Arc<dyn NetworkSession>
        });
        let executor: Arc<dyn Executor> = Arc::new(SerialQueue::new("dbxkit.main")?);
        Ok(Self::new(config, dispatcher, executor))
    }

    /// `Authorization` value for app-auth routes, e.g. HTTP basic with the app key and secret.
    pub fn with_app_auth_header(mut self, value: impl Into<String>) -> Self {
        self.builder.app_auth_header = Some(value.into());
        self
    }

    /// Report errors to `handlers`, e.g. one registry shared by several clients.
    pub fn with_error_handlers(mut self, handlers: Arc<GlobalErrorHandlers>) -> Self {
        self.error_handlers = handlers;
        self
    }

    /// Observers of every failed request made through this client.
    pub fn error_handlers(&self) -> &Arc<GlobalErrorHandlers> {
        &self.error_handlers
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn user_agent(&self) -> &str {
        &self.builder.user_agent
    }

    pub fn dispatcher(&self) -> &Arc<SessionDispatcher> {
        &self.dispatcher
    }

    pub fn default_executor(&self) -> &Arc<dyn Executor> {
        &self.default_executor
    }

    pub fn codec(&self) -> &ReconnectionCodec {
        &self.codec
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    fn url<A, R, E>(&self, route: &Route<A, R, E>) -> String {
        format!(
            "{}/2/{}/{}",
            self.builder.hosts.url_for(route.attributes.host).trim_end_matches('/'),
            route.namespace,
            route.name
        )
    }

    /// Serialize eagerly and return a closure that builds the request later.
    fn request_factory<A: Serialize, R, E>(
        &self,
        route: &Route<A, R, E>,
        args: &A,
    ) -> Result<impl FnOnce() -> HttpRequest + Send + 'static, ClientError> {
        let serialized = serde_json::to_string(args).map_err(|e| ClientError::ArgumentSerialization(e.to_string()))?;
        let builder = self.builder.clone();
        let attributes = route.attributes;
        let url = self.url(route);
        Ok(move || builder.build(attributes, &url, &serialized))
    }

    fn stamp(&self, request: &ApiRequest, info: PersistedRequestInfo) {
        if !self.dispatcher.is_background() {
            return;
        }
        match self.codec.encode(&info) {
            Ok(description) => request.set_task_description(Some(description)),
            Err(e) => warn!(error = %e, route = %info.namespace_route_name(), "Could not persist reconnection info"),
        }
    }

    pub fn request<A: Serialize, R, E>(&self, route: &Route<A, R, E>, args: &A) -> RpcRequest<R, E> {
        let request = match self.request_factory(route, args) {
            Ok(make_request) => self.dispatcher.data_request(make_request),
            Err(e) => ApiRequest::failed(e),
        };
        debug!(route = %route.namespace_route_name(), "RPC request");
        RpcRequest::new(request, Arc::clone(&self.files), Arc::clone(&self.default_executor), self.codec.clone())
            .with_error_handlers(Arc::clone(&self.error_handlers))
    }

    pub fn upload<A: Serialize, R, E>(
        &self,
        route: &Route<A, R, E>,
        args: &A,
        body: impl Into<UploadBody>,
    ) -> UploadRequest<R, E> {
        let request = match self.request_factory(route, args) {
            Ok(make_request) => {
                let request = self.dispatcher.upload_request(make_request, body.into());
                self.stamp(&request, PersistedRequestInfo::upload(route.namespace, route.name));
                request
            }
            Err(e) => ApiRequest::failed(e),
        };
        debug!(route = %route.namespace_route_name(), "Upload request");
        UploadRequest::new(request, Arc::clone(&self.files), Arc::clone(&self.default_executor), self.codec.clone())
            .with_error_handlers(Arc::clone(&self.error_handlers))
    }

    pub fn download_file<A: Serialize, R, E>(
        &self,
        route: &Route<A, R, E>,
        args: &A,
        destination: impl Into<PathBuf>,
        overwrite: bool,
    ) -> DownloadRequestFile<R, E> {
        let destination = destination.into();
        let request = match self.request_factory(route, args) {
            Ok(make_request) => {
                let request = self.dispatcher.download_file_request(make_request);
                self.stamp(
                    &request,
                    PersistedRequestInfo::download_file(route.namespace, route.name, destination.clone(), overwrite),
                );
                request
            }
            Err(e) => ApiRequest::failed(e),
        };
        debug!(route = %route.namespace_route_name(), destination = %destination.display(), "Download request");
        DownloadRequestFile::new(
            request,
            Arc::clone(&self.files),
            Arc::clone(&self.default_executor),
            self.codec.clone(),
            destination,
            overwrite,
        )
        .with_error_handlers(Arc::clone(&self.error_handlers))
    }

    pub fn download_memory<A: Serialize, R, E>(&self, route: &Route<A, R, E>, args: &A) -> DownloadRequestMemory<R, E> {
        let request = match self.request_factory(route, args) {
            Ok(make_request) => self.dispatcher.data_request(make_request),
            Err(e) => ApiRequest::failed(e),
        };
        DownloadRequestMemory::new(request, Arc::clone(&self.files), Arc::clone(&self.default_executor), self.codec.clone())
            .with_error_handlers(Arc::clone(&self.error_handlers))
    }

    /// Rebuild handles for every background task that survived a relaunch.
    pub async fn reconnect_requests<T>(&self, table: &RouteTable<T>) -> Vec<Result<T, ReconnectionFailure>> {
        let pending = self.dispatcher.pending_reconnection_requests().await;
        pending
            .into_iter()
            .map(|request| {
                table.rebuild(ReconnectParts {
                    request,
                    files: Arc::clone(&self.files),
                    default_executor: Arc::clone(&self.default_executor),
                    codec: self.codec.clone(),
                    error_handlers: Arc::clone(&self.error_handlers),
                })
            })
            .collect()
    }
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("user_agent", &self.builder.user_agent)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ascii_escape() {
        assert_eq!(ascii_escape(r#"{"path":"/a.txt"}"#), r#"{"path":"/a.txt"}"#);
        assert_eq!(ascii_escape("{\"path\":\"/caf\u{e9}\"}"), "{\"path\":\"/caf\\u00e9\"}");
        // Astral characters become a surrogate pair.
        assert_eq!(ascii_escape("\u{1F600}"), "\\ud83d\\ude00");
    }

    #[test]
    fn test_escaped_header_still_decodes() {
        let escaped = ascii_escape("{\"path\":\"/\u{65e5}\u{672c}\"}");
        assert!(escaped.is_ascii());
        let value: serde_json::Value = serde_json::from_str(&escaped).unwrap();
        assert_eq!(value["path"], "/\u{65e5}\u{672c}");
    }

    #[test]
    fn test_default_user_agent_prefix() {
        assert!(DEFAULT_USER_AGENT.starts_with("OfficialDbxkitRustSDKv2/"));
    }

    proptest! {
        #[test]
        fn test_escaped_arguments_are_ascii_and_lossless(path in "\\PC{0,40}") {
            let json = serde_json::to_string(&serde_json::json!({ "path": &path })).unwrap();
            let escaped = ascii_escape(&json);
            prop_assert!(escaped.is_ascii());
            prop_assert!(HeaderValue::from_str(&escaped).is_ok());
            let decoded: serde_json::Value = serde_json::from_str(&escaped).unwrap();
            prop_assert_eq!(decoded["path"].as_str(), Some(path.as_str()));
        }
    }
}
