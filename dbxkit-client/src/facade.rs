// Typed request handles
// Each handle wraps one `ApiRequest` and turns its raw outcome into the
// route's result type. A handle keeps itself alive until its outcome has been
// delivered or the request is cancelled, so callers may drop it freely.

use crate::global_errors::GlobalErrorHandlers;
use crate::request::{ApiRequest, CompletionHandler, Progress, RequestOutcome, ResponseParts};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dbxkit_core::{CallError, ClientError, Executor, FilesAccess, Inline, ReconnectionCodec, TaskId};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Header carrying the result of download-style routes.
pub const API_RESULT_HEADER: &str = "Dropbox-Api-Result";

type Converter<T, E> = Box<dyn FnOnce(&Shared, ResponseParts) -> Result<T, CallError<E>> + Send>;

struct Shared {
    request: Arc<ApiRequest>,
    files: Arc<dyn FilesAccess>,
    default_executor: Arc<dyn Executor>,
    codec: ReconnectionCodec,
    error_handlers: OnceLock<Arc<GlobalErrorHandlers>>,
    self_retain: Mutex<Option<Arc<Shared>>>,
}

impl Shared {
    fn new(
        request: Arc<ApiRequest>,
        files: Arc<dyn FilesAccess>,
        default_executor: Arc<dyn Executor>,
        codec: ReconnectionCodec,
    ) -> Arc<Self> {
        let shared = Arc::new(Self {
            request,
            files,
            default_executor,
            codec,
            error_handlers: OnceLock::new(),
            self_retain: Mutex::new(None),
        });
        *shared.self_retain.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&shared));

        let weak = Arc::downgrade(&shared);
        shared.request.set_cleanup_handler(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.release();
            }
        }));
        shared
    }

    fn release(&self) {
        let retained = self.self_retain.lock().unwrap_or_else(PoisonError::into_inner).take();
        if retained.is_some() {
            trace!("Request handle released");
        }
    }

    fn deliver<T, E>(
        self: &Arc<Self>,
        worker: Option<Arc<dyn Executor>>,
        executor: Arc<dyn Executor>,
        convert: Converter<T, E>,
        handler: impl FnOnce(Result<T, CallError<E>>) + Send + 'static,
    ) where
        T: Send + 'static,
        E: Send + 'static,
    {
        let weak: Weak<Shared> = Arc::downgrade(self);
        let completion_executor = worker.unwrap_or_else(|| Arc::clone(&executor));
        let hop = !Arc::ptr_eq(&completion_executor, &executor);

        let completion: CompletionHandler = Box::new(move |outcome| {
            let result = match weak.upgrade() {
                Some(shared) => {
                    let observed = shared
                        .error_handlers
                        .get()
                        .filter(|handlers| !handlers.is_empty())
                        .map(|handlers| (Arc::clone(handlers), raw_error(&outcome)));
                    let result = match outcome {
                        RequestOutcome::Response(parts) => convert(&shared, parts),
                        RequestOutcome::Error(e) => Err(CallError::ClientError(e)),
                    };
                    if let (Err(e), Some((handlers, raw))) = (&result, observed) {
                        handlers.report(&raw.unwrap_or_else(|| e.erased(|_| Value::Null)));
                    }
                    result
                }
                None => Err(CallError::ClientError(ClientError::RequestObjectDeallocated)),
            };
            if hop {
                executor.execute(Box::new(move || handler(result)));
            } else {
                handler(result);
            }
        });
        self.request.set_completion_handler(completion_executor, completion);
    }

    fn persist_client_info(&self, value: Option<String>) {
        let description = self.request.task_description();
        let info = match self.codec.decode(description.as_deref()) {
            Ok(info) => info,
            Err(e) => {
                debug!(error = %e, "Request carries no reconnection info, persisted string dropped");
                return;
            }
        };
        match self.codec.encode(&info.with_client_info(value)) {
            Ok(encoded) => self.request.set_task_description(Some(encoded)),
            Err(e) => debug!(error = %e, "Could not encode persisted string"),
        }
    }

    fn client_persisted_string(&self) -> Option<String> {
        let description = self.request.task_description()?;
        self.codec
            .decode(Some(&description))
            .ok()
            .and_then(|info| info.client_provided_info().map(str::to_string))
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared").field("request", &self.request).finish()
    }
}

/// The error of a failed response, decoded without the route's error type.
fn raw_error(outcome: &RequestOutcome) -> Option<CallError<Value>> {
    match outcome {
        RequestOutcome::Response(parts) if !parts.response.is_success() => Some(CallError::from_response(
            parts.response.status,
            &parts.response.headers,
            &parts.body,
        )),
        _ => None,
    }
}

/// Deserialize a JSON body, treating an empty body as `null`.
fn parse_json<T: DeserializeOwned, E>(body: &[u8]) -> Result<T, CallError<E>> {
    let body: &[u8] = if body.is_empty() { b"null" } else { body };
    serde_json::from_slice(body).map_err(|e| CallError::SerializationError(format!("Could not decode result: {}", e)))
}

fn parse_body<T: DeserializeOwned, E: DeserializeOwned>(parts: ResponseParts) -> Result<T, CallError<E>> {
    if !parts.response.is_success() {
        return Err(CallError::from_response(parts.response.status, &parts.response.headers, &parts.body));
    }
    parse_json(&parts.body)
}

fn parse_result_header<T: DeserializeOwned, E: DeserializeOwned>(parts: &ResponseParts) -> Result<T, CallError<E>> {
    if !parts.response.is_success() {
        return Err(CallError::from_response(parts.response.status, &parts.response.headers, &parts.body));
    }
    let value = parts
        .response
        .headers
        .get(API_RESULT_HEADER)
        .ok_or_else(|| CallError::SerializationError(format!("Missing {} header", API_RESULT_HEADER)))?;
    let value = value
        .to_str()
        .map_err(|e| CallError::SerializationError(format!("Unreadable {} header: {}", API_RESULT_HEADER, e)))?;
    parse_json(value.as_bytes())
}

macro_rules! request_handle {
    ($name:ident, $output:ty, $converter:ident) => {
        impl<R, E> $name<R, E> {
            pub fn api_request(&self) -> &Arc<ApiRequest> {
                &self.shared.request
            }

            pub fn task_identifier(&self) -> Option<TaskId> {
                self.shared.request.task_identifier()
            }

            pub fn cancel(&self) {
                self.shared.request.cancel();
            }

            /// Progress updates, delivered on the default executor.
            pub fn progress(&self, handler: impl Fn(Progress) + Send + Sync + 'static) -> &Self {
                self.progress_on(Arc::clone(&self.shared.default_executor), handler)
            }

            pub fn progress_on(
                &self,
                executor: Arc<dyn Executor>,
                handler: impl Fn(Progress) + Send + Sync + 'static,
            ) -> &Self {
                self.shared.request.set_progress_handler(executor, Arc::new(handler));
                self
            }

            /// The task will not start before `date`.
            pub fn setting_earliest_begin_date(&self, date: DateTime<Utc>) -> &Self {
                self.shared.request.set_earliest_begin_date(Some(date));
                self
            }

            pub fn earliest_begin_date(&self) -> Option<DateTime<Utc>> {
                self.shared.request.earliest_begin_date()
            }

            /// Also report this request's error to `handlers`.
            pub fn with_error_handlers(self, handlers: Arc<GlobalErrorHandlers>) -> Self {
                if self.shared.error_handlers.set(handlers).is_err() {
                    debug!("Error handlers already attached");
                }
                self
            }
        }

        impl<R, E> $name<R, E>
        where
            R: DeserializeOwned + Send + 'static,
            E: DeserializeOwned + Send + 'static,
        {
            /// Handle the outcome on the default executor.
            pub fn response(&self, handler: impl FnOnce(Result<$output, CallError<E>>) + Send + 'static) -> &Self {
                self.response_on(Arc::clone(&self.shared.default_executor), handler)
            }

            pub fn response_on(
                &self,
                executor: Arc<dyn Executor>,
                handler: impl FnOnce(Result<$output, CallError<E>>) + Send + 'static,
            ) -> &Self {
                self.shared.deliver(None, executor, self.$converter(), handler);
                self
            }

            /// Deserialize on `worker`, then call `handler` on `executor`.
            pub fn response_deserializing_on(
                &self,
                worker: Arc<dyn Executor>,
                executor: Arc<dyn Executor>,
                handler: impl FnOnce(Result<$output, CallError<E>>) + Send + 'static,
            ) -> &Self {
                self.shared.deliver(Some(worker), executor, self.$converter(), handler);
                self
            }

            /// Wait for the outcome instead of registering a handler.
            pub async fn response_result(&self) -> Result<$output, CallError<E>> {
                let (tx, rx) = oneshot::channel();
                self.response_on(Arc::new(Inline), move |result| {
                    let _ = tx.send(result);
                });
                rx.await
                    .unwrap_or(Err(CallError::ClientError(ClientError::UnexpectedState)))
            }
        }

        impl<R, E> fmt::Debug for $name<R, E> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("request", &self.shared.request)
                    .finish()
            }
        }
    };
}

macro_rules! persisting {
    ($name:ident) => {
        impl<R, E> $name<R, E> {
            /// Store a caller string in the reconnection info of a background
            /// request. Foreground requests have none and ignore it.
            pub fn persisting_string(&self, value: Option<String>) -> &Self {
                self.shared.persist_client_info(value);
                self
            }

            pub fn client_persisted_string(&self) -> Option<String> {
                self.shared.client_persisted_string()
            }
        }
    };
}

/// JSON in, JSON out.
pub struct RpcRequest<R, E> {
    shared: Arc<Shared>,
    _types: PhantomData<fn() -> (R, E)>,
}

impl<R, E> RpcRequest<R, E> {
    pub fn new(
        request: Arc<ApiRequest>,
        files: Arc<dyn FilesAccess>,
        default_executor: Arc<dyn Executor>,
        codec: ReconnectionCodec,
    ) -> Self {
        Self {
            shared: Shared::new(request, files, default_executor, codec),
            _types: PhantomData,
        }
    }
}

impl<R: DeserializeOwned + Send + 'static, E: DeserializeOwned + Send + 'static> RpcRequest<R, E> {
    fn converter(&self) -> Converter<R, E> {
        Box::new(|_, parts| parse_body(parts))
    }
}

request_handle!(RpcRequest, R, converter);

/// Raw bytes up, JSON result back.
pub struct UploadRequest<R, E> {
    shared: Arc<Shared>,
    _types: PhantomData<fn() -> (R, E)>,
}

impl<R, E> UploadRequest<R, E> {
    pub fn new(
        request: Arc<ApiRequest>,
        files: Arc<dyn FilesAccess>,
        default_executor: Arc<dyn Executor>,
        codec: ReconnectionCodec,
    ) -> Self {
        Self {
            shared: Shared::new(request, files, default_executor, codec),
            _types: PhantomData,
        }
    }
}

impl<R: DeserializeOwned + Send + 'static, E: DeserializeOwned + Send + 'static> UploadRequest<R, E> {
    fn converter(&self) -> Converter<R, E> {
        Box::new(|_, parts| parse_body(parts))
    }
}

request_handle!(UploadRequest, R, converter);
persisting!(UploadRequest);

/// Result from the `Dropbox-Api-Result` header, content in memory.
pub struct DownloadRequestMemory<R, E> {
    shared: Arc<Shared>,
    _types: PhantomData<fn() -> (R, E)>,
}

impl<R, E> DownloadRequestMemory<R, E> {
    pub fn new(
        request: Arc<ApiRequest>,
        files: Arc<dyn FilesAccess>,
        default_executor: Arc<dyn Executor>,
        codec: ReconnectionCodec,
    ) -> Self {
        Self {
            shared: Shared::new(request, files, default_executor, codec),
            _types: PhantomData,
        }
    }
}

impl<R: DeserializeOwned + Send + 'static, E: DeserializeOwned + Send + 'static> DownloadRequestMemory<R, E> {
    fn converter(&self) -> Converter<(R, Bytes), E> {
        Box::new(|_, parts| {
            let result = parse_result_header(&parts)?;
            Ok((result, parts.body))
        })
    }
}

request_handle!(DownloadRequestMemory, (R, Bytes), converter);

/// Result from the `Dropbox-Api-Result` header, content moved to `destination`.
pub struct DownloadRequestFile<R, E> {
    shared: Arc<Shared>,
    destination: PathBuf,
    overwrite: bool,
    _types: PhantomData<fn() -> (R, E)>,
}

impl<R, E> DownloadRequestFile<R, E> {
    pub fn new(
        request: Arc<ApiRequest>,
        files: Arc<dyn FilesAccess>,
        default_executor: Arc<dyn Executor>,
        codec: ReconnectionCodec,
        destination: impl Into<PathBuf>,
        overwrite: bool,
    ) -> Self {
        Self {
            shared: Shared::new(request, files, default_executor, codec),
            destination: destination.into(),
            overwrite,
            _types: PhantomData,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }
}

impl<R: DeserializeOwned + Send + 'static, E: DeserializeOwned + Send + 'static> DownloadRequestFile<R, E> {
    fn converter(&self) -> Converter<(R, PathBuf), E> {
        let destination = self.destination.clone();
        let overwrite = self.overwrite;
        Box::new(move |shared, parts| {
            let result = parse_result_header(&parts)?;
            let location = parts
                .location
                .ok_or(CallError::ClientError(ClientError::UnexpectedState))?;
            let moved = shared
                .files
                .move_file(&location, &destination, overwrite)
                .map_err(|e| CallError::ClientError(ClientError::FileAccessError(e)))?;
            Ok((result, moved))
        })
    }
}

request_handle!(DownloadRequestFile, (R, PathBuf), converter);
persisting!(DownloadRequestFile);
