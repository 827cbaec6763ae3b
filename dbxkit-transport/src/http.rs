// HTTP session over reqwest
// Each resumed task runs on the session's runtime and reports to the delegate
// from there. Background identifiers are accepted but tasks do not outlive
// the process.

use crate::session::{DelegateRef, NetworkSession};
use crate::task::{HttpRequest, HttpResponse, NetworkTask, TaskKind, TaskState, UploadBody};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dbxkit_core::{TaskId, TaskIdAllocator, TransportError};
use futures::StreamExt;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    /// Background session identifier.
    pub identifier: Option<String>,
    pub timeout: Option<Duration>,
    /// Where downloads are written before the delegate moves them.
    pub download_dir: PathBuf,
}

impl Default for HttpSessionConfig {
    fn default() -> Self {
        Self {
            identifier: None,
            timeout: Some(Duration::from_secs(100)),
            download_dir: std::env::temp_dir(),
        }
    }
}

struct SessionShared {
    client: reqwest::Client,
    delegate: DelegateRef,
    download_dir: PathBuf,
    tasks: DashMap<TaskId, Arc<HttpTask>>,
}

pub struct HttpSession {
    identifier: Option<String>,
    handle: Handle,
    ids: TaskIdAllocator,
    shared: Arc<SessionShared>,
    invalidated: AtomicBool,
}

impl HttpSession {
    pub fn new(config: HttpSessionConfig, handle: Handle, delegate: DelegateRef) -> Result<Self, TransportError> {
        let client = Self::build_client(&config)?;
        Ok(Self::with_client(client, config, handle, delegate))
    }

    /// A reqwest client honoring the config's timeout.
    pub fn build_client(config: &HttpSessionConfig) -> Result<reqwest::Client, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        builder
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))
    }

    pub fn with_client(client: reqwest::Client, config: HttpSessionConfig, handle: Handle, delegate: DelegateRef) -> Self {
        Self {
            identifier: config.identifier,
            handle,
            ids: TaskIdAllocator::new(),
            shared: Arc::new(SessionShared {
                client,
                delegate,
                download_dir: config.download_dir,
                tasks: DashMap::new(),
            }),
            invalidated: AtomicBool::new(false),
        }
    }

    fn make_task(&self, kind: TaskKind, request: HttpRequest, body: Option<UploadBody>) -> Arc<dyn NetworkTask> {
        let id = self.ids.allocate();
        let task = Arc::new_cyclic(|this| HttpTask {
            id,
            kind,
            request,
            body: Mutex::new(body),
            inner: Mutex::new(TaskInner {
                state: TaskState::Suspended,
                response: None,
                error: None,
                description: None,
                earliest_begin_date: None,
            }),
            cancel: CancellationToken::new(),
            this: this.clone(),
            session: Arc::downgrade(&self.shared),
            handle: self.handle.clone(),
            session_invalidated: self.invalidated.load(Ordering::SeqCst),
        });
        self.shared.tasks.insert(id, Arc::clone(&task));
        trace!(task_id = %id, kind = ?kind, "Created HTTP task");
        task
    }
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("identifier", &self.identifier)
            .field("tasks", &self.shared.tasks.len())
            .finish()
    }
}

#[async_trait]
impl NetworkSession for HttpSession {
    fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    fn data_task(&self, request: HttpRequest) -> Arc<dyn NetworkTask> {
        self.make_task(TaskKind::Data, request, None)
    }

    fn upload_task(&self, request: HttpRequest, body: UploadBody) -> Arc<dyn NetworkTask> {
        self.make_task(TaskKind::Upload, request, Some(body))
    }

    fn download_task(&self, request: HttpRequest) -> Arc<dyn NetworkTask> {
        self.make_task(TaskKind::Download, request, None)
    }

    async fn all_tasks(&self) -> Vec<Arc<dyn NetworkTask>> {
        self.shared
            .tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()) as Arc<dyn NetworkTask>)
            .collect()
    }

    fn invalidate_and_cancel(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        let tasks: Vec<Arc<HttpTask>> = self.shared.tasks.iter().map(|e| Arc::clone(e.value())).collect();
        debug!(count = tasks.len(), "Invalidating HTTP session");
        for task in tasks {
            task.cancel();
        }
    }
}

#[derive(Debug)]
struct TaskInner {
    state: TaskState,
    response: Option<HttpResponse>,
    error: Option<TransportError>,
    description: Option<String>,
    earliest_begin_date: Option<DateTime<Utc>>,
}

pub struct HttpTask {
    id: TaskId,
    kind: TaskKind,
    request: HttpRequest,
    body: Mutex<Option<UploadBody>>,
    inner: Mutex<TaskInner>,
    cancel: CancellationToken,
    this: Weak<HttpTask>,
    session: Weak<SessionShared>,
    handle: Handle,
    session_invalidated: bool,
}

impl HttpTask {
    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>) {
        let Some(shared) = self.session.upgrade() else {
            return;
        };
        let dyn_task: Arc<dyn NetworkTask> = self.clone();

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            r = self.perform(&shared, &dyn_task) => r,
        };

        let error = result.err();
        {
            let mut inner = self.lock();
            inner.state = TaskState::Completed;
            // Headers alone don't make a response once the body was cut off.
            if error.is_some() {
                inner.response = None;
            }
            inner.error = error.clone();
        }
        shared.tasks.remove(&self.id);
        debug!(task_id = %self.id, error = ?error, "HTTP task finished");

        if let Some(delegate) = shared.delegate.get() {
            delegate.did_complete(&dyn_task, error);
        }
    }

    async fn perform(&self, shared: &SessionShared, dyn_task: &Arc<dyn NetworkTask>) -> Result<(), TransportError> {
        if self.session_invalidated {
            return Err(TransportError::SessionInvalidated);
        }

        if let Some(begin) = self.earliest_begin_date() {
            if let Ok(wait) = (begin - Utc::now()).to_std() {
                trace!(task_id = %self.id, ?wait, "Delaying task until its begin date");
                tokio::time::sleep(wait).await;
            }
        }

        let mut builder = shared
            .client
            .request(self.request.method.clone(), &self.request.url)
            .headers(self.request.headers.clone());

        let body = self.body.lock().unwrap_or_else(PoisonError::into_inner).take();
        builder = match body {
            Some(UploadBody::Data(bytes)) => {
                let len = bytes.len() as u64;
                if let Some(delegate) = shared.delegate.get() {
                    delegate.did_send_body_data(dyn_task, len, len, Some(len));
                }
                builder.body(bytes)
            }
            Some(UploadBody::File(path)) => {
                let file = tokio::fs::File::open(&path).await?;
                let expected = file.metadata().await.ok().map(|m| m.len());
                let delegate = shared.delegate.clone();
                let task = Arc::clone(dyn_task);
                let mut total = 0u64;
                let stream = ReaderStream::new(file).inspect(move |chunk| {
                    if let Ok(chunk) = chunk {
                        total += chunk.len() as u64;
                        if let Some(d) = delegate.get() {
                            d.did_send_body_data(&task, chunk.len() as u64, total, expected);
                        }
                    }
                });
                builder.body(reqwest::Body::wrap_stream(stream))
            }
            Some(UploadBody::Stream(stream)) => builder.body(reqwest::Body::wrap_stream(stream)),
            None => match &self.request.body {
                Some(bytes) => builder.body(bytes.clone()),
                None => builder,
            },
        };

        let mut response = builder.send().await.map_err(map_reqwest_error)?;
        let expected = response.content_length();
        self.lock().response = Some(HttpResponse {
            status: response.status(),
            headers: response.headers().clone(),
        });

        match self.kind {
            TaskKind::Data | TaskKind::Upload => {
                while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
                    if let Some(delegate) = shared.delegate.get() {
                        delegate.did_receive_data(dyn_task, chunk);
                    }
                }
                Ok(())
            }
            TaskKind::Download => {
                // Removed on drop, whichever way this future ends.
                let (file, location) = tempfile::Builder::new()
                    .prefix("dbxkit-")
                    .tempfile_in(&shared.download_dir)?
                    .into_parts();
                let mut file = tokio::fs::File::from_std(file);
                let mut written = 0u64;
                while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                    if let Some(delegate) = shared.delegate.get() {
                        delegate.did_write_data(dyn_task, chunk.len() as u64, written, expected);
                    }
                }
                file.flush().await?;
                drop(file);

                if let Some(delegate) = shared.delegate.get() {
                    delegate.did_finish_downloading(dyn_task, &location);
                }
                if let Err(e) = location.close() {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(task_id = %self.id, error = %e, "Could not remove download file");
                    }
                }
                Ok(())
            }
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::TimedOut
    } else if err.is_connect() {
        TransportError::Connection(err.to_string())
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Http(err.to_string())
    }
}

impl NetworkTask for HttpTask {
    fn task_identifier(&self) -> TaskId {
        self.id
    }

    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn state(&self) -> TaskState {
        self.lock().state
    }

    fn resume(&self) {
        {
            let mut inner = self.lock();
            if inner.state != TaskState::Suspended {
                return;
            }
            inner.state = TaskState::Running;
        }
        if let Some(this) = self.this.upgrade() {
            self.handle.spawn(this.run());
        }
    }

    fn cancel(&self) {
        let was_suspended = {
            let mut inner = self.lock();
            match inner.state {
                TaskState::Completed | TaskState::Canceling => return,
                TaskState::Suspended => {
                    inner.state = TaskState::Running;
                    true
                }
                TaskState::Running => {
                    inner.state = TaskState::Canceling;
                    false
                }
            }
        };
        self.cancel.cancel();
        // A task that never ran still owes the delegate its terminal callback.
        if was_suspended {
            if let Some(this) = self.this.upgrade() {
                self.handle.spawn(this.run());
            }
        }
    }

    fn response(&self) -> Option<HttpResponse> {
        self.lock().response.clone()
    }

    fn error(&self) -> Option<TransportError> {
        self.lock().error.clone()
    }

    fn original_request(&self) -> Option<HttpRequest> {
        Some(self.request.clone())
    }

    fn task_description(&self) -> Option<String> {
        self.lock().description.clone()
    }

    fn set_task_description(&self, description: Option<String>) {
        self.lock().description = description;
    }

    fn earliest_begin_date(&self) -> Option<DateTime<Utc>> {
        self.lock().earliest_begin_date
    }

    fn set_earliest_begin_date(&self, date: Option<DateTime<Utc>>) {
        self.lock().earliest_begin_date = date;
    }
}

impl fmt::Debug for HttpTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTask")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("url", &self.request.url)
            .finish()
    }
}
