// Rebuilding typed requests around tasks that survived a relaunch.

use crate::facade::{DownloadRequestFile, UploadRequest};
use crate::global_errors::GlobalErrorHandlers;
use crate::request::ApiRequest;
use dbxkit_core::{
    Executor, FilesAccess, PersistedRequestInfo, ReconnectionCodec, ReconnectionError,
    ReconnectionErrorKind, Route,
};
use dbxkit_transport::NetworkTask;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Everything a typed handle needs besides its route.
#[derive(Debug, Clone)]
pub struct ReconnectParts {
    pub request: Arc<ApiRequest>,
    pub files: Arc<dyn FilesAccess>,
    pub default_executor: Arc<dyn Executor>,
    pub codec: ReconnectionCodec,
    pub error_handlers: Arc<GlobalErrorHandlers>,
}

type Build<T> = Box<dyn Fn(ReconnectParts, PersistedRequestInfo) -> Result<T, ReconnectionErrorKind> + Send + Sync>;

/// Maps `namespace/name` to a constructor for that route's handle.
///
/// `T` is the caller's sum type over the handles it knows how to resume.
pub struct RouteTable<T> {
    routes: HashMap<String, Build<T>>,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RouteTable<T> {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    pub fn upload<A, R, E>(
        mut self,
        route: &Route<A, R, E>,
        wrap: impl Fn(UploadRequest<R, E>) -> T + Send + Sync + 'static,
    ) -> Self
    where
        A: 'static,
        R: 'static,
        E: 'static,
    {
        let build: Build<T> = Box::new(move |parts, info| match info {
            PersistedRequestInfo::Upload(_) => Ok(wrap(
                UploadRequest::new(parts.request, parts.files, parts.default_executor, parts.codec)
                    .with_error_handlers(parts.error_handlers),
            )),
            PersistedRequestInfo::DownloadFile(_) => Err(ReconnectionErrorKind::BadPersistedStringFormat),
        });
        self.routes.insert(route.namespace_route_name(), build);
        self
    }

    pub fn download_file<A, R, E>(
        mut self,
        route: &Route<A, R, E>,
        wrap: impl Fn(DownloadRequestFile<R, E>) -> T + Send + Sync + 'static,
    ) -> Self
    where
        A: 'static,
        R: 'static,
        E: 'static,
    {
        let build: Build<T> = Box::new(move |parts, info| match info {
            PersistedRequestInfo::DownloadFile(info) => Ok(wrap(
                DownloadRequestFile::new(
                    parts.request,
                    parts.files,
                    parts.default_executor,
                    parts.codec,
                    info.destination,
                    info.overwrite,
                )
                .with_error_handlers(parts.error_handlers),
            )),
            PersistedRequestInfo::Upload(_) => Err(ReconnectionErrorKind::BadPersistedStringFormat),
        });
        self.routes.insert(route.namespace_route_name(), build);
        self
    }

    pub fn contains(&self, namespace_route_name: &str) -> bool {
        self.routes.contains_key(namespace_route_name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decode the request's persisted info and build its handle.
    pub fn rebuild(&self, parts: ReconnectParts) -> Result<T, ReconnectionFailure> {
        let description = parts.request.task_description();
        let info = match parts.codec.decode(description.as_deref()) {
            Ok(info) => info,
            Err(error) => return Err(ReconnectionFailure::new(error, parts.request)),
        };

        let key = info.namespace_route_name();
        let Some(build) = self.routes.get(&key) else {
            warn!(target: "dbxkit::background", route = %key, "No reconnection case for route");
            let error = ReconnectionError::new(ReconnectionErrorKind::MissingReconnectionCase, description);
            return Err(ReconnectionFailure::new(error, parts.request));
        };

        let request = Arc::clone(&parts.request);
        match build(parts, info) {
            Ok(handle) => {
                debug!(target: "dbxkit::background", route = %key, task_id = ?request.task_identifier(), "Reconnected request");
                Ok(handle)
            }
            Err(kind) => Err(ReconnectionFailure::new(ReconnectionError::new(kind, description), request)),
        }
    }
}

impl<T> fmt::Debug for RouteTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.routes.keys().collect();
        keys.sort();
        f.debug_struct("RouteTable").field("routes", &keys).finish()
    }
}

/// A surviving task that could not be rebuilt. The request still owns the
/// task, so it can be inspected or cancelled.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct ReconnectionFailure {
    pub error: ReconnectionError,
    pub request: Arc<ApiRequest>,
}

impl ReconnectionFailure {
    pub fn new(error: ReconnectionError, request: Arc<ApiRequest>) -> Self {
        Self { error, request }
    }

    pub fn task(&self) -> Option<Arc<dyn NetworkTask>> {
        self.request.task()
    }

    pub fn cancel(&self) {
        self.request.cancel();
    }
}
