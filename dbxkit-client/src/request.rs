// Token-gated request
// Owns the mutable state of one logical request, from the credential refresh
// through task creation to the terminal callback.
//
// Every field lives behind one mutex. Handlers are copied out under the lock
// and invoked only after it is released, so a handler may call back into its
// own request.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dbxkit_core::{
    AccessTokenProvider, ClientError, Executor, FilesAccess, FilesAccessError, RefreshOutcome,
    TaskId, TransportError,
};
use dbxkit_transport::{HttpResponse, NetworkTask, TaskKind};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestPhase {
    Created,
    AwaitingAuth,
    TaskPending,
    InFlight,
    Completed,
    Cancelled,
}

impl RequestPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestPhase::Completed | RequestPhase::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn fraction_completed(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some(self.completed as f64 / total as f64),
        }
    }
}

/// A response received from the server, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseParts {
    pub response: HttpResponse,
    /// Response body; for failed file downloads, the error body read from disk.
    pub body: Bytes,
    /// Temporary location of a successful file download.
    pub location: Option<PathBuf>,
}

/// The single terminal outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Response(ResponseParts),
    Error(ClientError),
}

pub type TaskFactory = Box<dyn FnOnce() -> Arc<dyn NetworkTask> + Send>;
pub type TaskCreationHook = Box<dyn FnOnce(&Arc<ApiRequest>, &Arc<dyn NetworkTask>) + Send>;
pub type CompletionHandler = Box<dyn FnOnce(RequestOutcome) + Send>;
pub type ProgressHandler = Arc<dyn Fn(Progress) + Send + Sync>;
pub type CleanupHandler = Box<dyn FnOnce() + Send>;

/// Collaborators shared by every request of a session.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub provider: Arc<dyn AccessTokenProvider>,
    pub files: Arc<dyn FilesAccess>,
    /// Runtime on which refresh outcomes are handled and tasks created.
    pub utility: Handle,
}

/// Task settings written before the task exists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedSettings {
    pub task_description: Option<String>,
    pub earliest_begin_date: Option<DateTime<Utc>>,
}

impl StagedSettings {
    fn apply(self, task: &dyn NetworkTask) {
        if let Some(description) = self.task_description {
            task.set_task_description(Some(description));
        }
        if let Some(date) = self.earliest_begin_date {
            task.set_earliest_begin_date(Some(date));
        }
    }
}

struct RequestState {
    phase: RequestPhase,
    task: Option<Arc<dyn NetworkTask>>,
    data: BytesMut,
    progress: Progress,
    download_location: Option<PathBuf>,
    download_error: Option<FilesAccessError>,
    cancelled: bool,
    // Set once the task has been resumed or cancelled at creation.
    start_decided: bool,
    outcome: Option<RequestOutcome>,
    delivered: bool,
    completion: Option<(Arc<dyn Executor>, CompletionHandler)>,
    progress_handler: Option<(Arc<dyn Executor>, ProgressHandler)>,
    cleanup: Option<CleanupHandler>,
    cleaned_up: bool,
    // `None` once applied to the task.
    staged: Option<StagedSettings>,
}

impl RequestState {
    fn new(phase: RequestPhase) -> Self {
        Self {
            phase,
            task: None,
            data: BytesMut::new(),
            progress: Progress::default(),
            download_location: None,
            download_error: None,
            cancelled: false,
            start_decided: false,
            outcome: None,
            delivered: false,
            completion: None,
            progress_handler: None,
            cleanup: None,
            cleaned_up: false,
            staged: Some(StagedSettings::default()),
        }
    }

    fn take_cleanup(&mut self) -> Option<CleanupHandler> {
        if self.cleaned_up {
            return None;
        }
        self.cleaned_up = true;
        self.cleanup.take()
    }
}

pub struct ApiRequest {
    state: Mutex<RequestState>,
    files: Option<Arc<dyn FilesAccess>>,
}

impl ApiRequest {
    /// Start a request: refresh the credential on the utility runtime, then
    /// create the task with `task_factory` and hand it to `on_task_creation`.
    pub fn new(ctx: &RequestContext, task_factory: TaskFactory, on_task_creation: TaskCreationHook) -> Arc<Self> {
        let request = Arc::new(Self {
            state: Mutex::new(RequestState::new(RequestPhase::Created)),
            files: Some(Arc::clone(&ctx.files)),
        });
        request.lock().phase = RequestPhase::AwaitingAuth;

        let provider = Arc::clone(&ctx.provider);
        let weak = Arc::downgrade(&request);
        ctx.utility.spawn(async move {
            let outcome = provider.refresh_access_token_if_necessary().await;
            match weak.upgrade() {
                Some(request) => request.handle_refresh(outcome, task_factory, on_task_creation),
                None => debug!("Request released before its token refresh finished"),
            }
        });

        request
    }

    /// Wrap a task that is already running, e.g. one that survived a relaunch.
    pub fn reconnected(task: Arc<dyn NetworkTask>, files: Arc<dyn FilesAccess>) -> Arc<Self> {
        let mut state = RequestState::new(RequestPhase::InFlight);
        state.task = Some(task);
        state.staged = None;
        state.start_decided = true;
        Arc::new(Self {
            state: Mutex::new(state),
            files: Some(files),
        })
    }

    /// A request that has already failed without touching the network.
    pub fn failed(error: ClientError) -> Arc<Self> {
        let mut state = RequestState::new(RequestPhase::Completed);
        state.outcome = Some(RequestOutcome::Error(error));
        state.staged = None;
        state.start_decided = true;
        // Nothing in flight to keep an owner alive for.
        state.cleaned_up = true;
        Arc::new(Self {
            state: Mutex::new(state),
            files: None,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_refresh(self: &Arc<Self>, outcome: RefreshOutcome, factory: TaskFactory, on_task_creation: TaskCreationHook) {
        if let RefreshOutcome::Failed(error) = &outcome {
            if !error.is_invalid_grant() {
                warn!(error = %error, "Token refresh failed, completing request without a network call");
                self.complete(RequestOutcome::Error(ClientError::OauthError(error.clone())));
                return;
            }
            debug!("Refresh token rejected, letting the server report the auth error");
        }
        self.create_task(factory, on_task_creation);
    }

    fn create_task(self: &Arc<Self>, factory: TaskFactory, on_task_creation: TaskCreationHook) {
        {
            let mut state = self.lock();
            if state.phase == RequestPhase::AwaitingAuth {
                state.phase = RequestPhase::TaskPending;
            }
        }

        let task = factory();

        {
            let mut state = self.lock();
            if let Some(staged) = state.staged.take() {
                staged.apply(task.as_ref());
            }
            state.task = Some(Arc::clone(&task));
            if state.phase == RequestPhase::TaskPending {
                state.phase = RequestPhase::InFlight;
            }
        }
        trace!(task_id = %task.task_identifier(), "Task created");

        on_task_creation(self, &task);

        // Decided under the lock so a concurrent cancel either sees the task
        // here or leaves the decision to this block.
        let mut state = self.lock();
        state.start_decided = true;
        if state.cancelled {
            debug!(task_id = %task.task_identifier(), "Request cancelled before its task started");
            task.cancel();
        } else {
            task.resume();
        }
    }

    /// Register the handler for the terminal outcome. A handler set after
    /// completion runs right away with the captured outcome.
    pub fn set_completion_handler(&self, executor: Arc<dyn Executor>, handler: CompletionHandler) {
        {
            let mut state = self.lock();
            if state.delivered {
                warn!("Completion handler set after the outcome was delivered, ignoring");
                return;
            }
            state.completion = Some((executor, handler));
        }
        self.deliver_if_ready();
    }

    pub fn set_progress_handler(&self, executor: Arc<dyn Executor>, handler: ProgressHandler) {
        self.lock().progress_handler = Some((executor, handler));
    }

    /// Runs once: after the completion handler, on cancellation, or right away
    /// if the request already finished.
    pub fn set_cleanup_handler(&self, handler: CleanupHandler) {
        let run_now = {
            let mut state = self.lock();
            if state.cleaned_up {
                Some(handler)
            } else {
                state.cleanup = Some(handler);
                None
            }
        };
        if let Some(handler) = run_now {
            handler();
        }
    }

    pub fn cancel(&self) {
        let cleanup = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            if state.phase != RequestPhase::Completed {
                state.phase = RequestPhase::Cancelled;
            }
            if state.start_decided {
                if let Some(task) = &state.task {
                    task.cancel();
                }
            }
            state.take_cleanup()
        };
        debug!("Request cancelled");
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.lock().phase
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn task(&self) -> Option<Arc<dyn NetworkTask>> {
        self.lock().task.clone()
    }

    pub fn task_identifier(&self) -> Option<TaskId> {
        self.lock().task.as_ref().map(|t| t.task_identifier())
    }

    pub fn progress(&self) -> Progress {
        self.lock().progress
    }

    pub fn task_description(&self) -> Option<String> {
        let state = self.lock();
        match &state.staged {
            Some(staged) => staged.task_description.clone(),
            None => state.task.as_ref().and_then(|t| t.task_description()),
        }
    }

    pub fn set_task_description(&self, description: Option<String>) {
        let mut state = self.lock();
        match state.staged.as_mut() {
            Some(staged) => staged.task_description = description,
            None => {
                if let Some(task) = &state.task {
                    task.set_task_description(description);
                }
            }
        }
    }

    pub fn earliest_begin_date(&self) -> Option<DateTime<Utc>> {
        let state = self.lock();
        match &state.staged {
            Some(staged) => staged.earliest_begin_date,
            None => state.task.as_ref().and_then(|t| t.earliest_begin_date()),
        }
    }

    pub fn set_earliest_begin_date(&self, date: Option<DateTime<Utc>>) {
        let mut state = self.lock();
        match state.staged.as_mut() {
            Some(staged) => staged.earliest_begin_date = date,
            None => {
                if let Some(task) = &state.task {
                    task.set_earliest_begin_date(date);
                }
            }
        }
    }

    pub fn handle_received_data(&self, data: Bytes) {
        let len = data.len() as u64;
        let is_data_task = {
            let mut state = self.lock();
            state.data.extend_from_slice(&data);
            matches!(state.task.as_ref().map(|t| t.kind()), Some(TaskKind::Data))
        };
        if is_data_task {
            self.report_progress(|p| p.completed += len);
        }
    }

    pub fn handle_sent_body_data(&self, total_bytes_sent: u64, total_bytes_expected: Option<u64>) {
        self.report_progress(|p| {
            p.completed = total_bytes_sent;
            p.total = total_bytes_expected;
        });
    }

    pub fn handle_wrote_download_data(&self, total_bytes_written: u64, total_bytes_expected: Option<u64>) {
        self.report_progress(|p| {
            p.completed = total_bytes_written;
            p.total = total_bytes_expected;
        });
    }

    /// Must run before the transport deletes `location`.
    pub fn handle_download_finished(&self, location: &Path) {
        let Some(files) = &self.files else {
            warn!("Download finished for a request without file access");
            return;
        };
        let moved = files.move_file_to_temporary_location(location);
        let mut state = self.lock();
        match moved {
            Ok(path) => state.download_location = Some(path),
            Err(e) => {
                warn!(error = %e, "Could not take ownership of downloaded file");
                state.download_error = Some(e);
            }
        }
    }

    pub fn handle_completion(&self, task: &Arc<dyn NetworkTask>, error: Option<TransportError>) {
        let response = task.response();
        let (data, location, download_error) = {
            let mut state = self.lock();
            (
                state.data.split().freeze(),
                state.download_location.take(),
                state.download_error.take(),
            )
        };

        let outcome = match (error, response) {
            (Some(TransportError::Cancelled), _) => {
                RequestOutcome::Error(ClientError::TransportError(TransportError::Cancelled))
            }
            (Some(error), Some(response)) if response.is_success() => {
                warn!(
                    task_id = %task.task_identifier(),
                    status = response.status.as_u16(),
                    error = %error,
                    "Task reported a success status together with a transport error"
                );
                RequestOutcome::Error(ClientError::ConflictingCompletion {
                    status: response.status.as_u16(),
                    error,
                })
            }
            (Some(error), _) => RequestOutcome::Error(ClientError::TransportError(error)),
            (None, None) => RequestOutcome::Error(ClientError::UnexpectedState),
            (None, Some(response)) => match download_error {
                Some(e) => RequestOutcome::Error(ClientError::FileAccessError(e)),
                None if task.kind() == TaskKind::Download => self.download_outcome(response, location, data),
                None => RequestOutcome::Response(ResponseParts {
                    response,
                    body: data,
                    location: None,
                }),
            },
        };

        self.complete(outcome);
    }

    fn download_outcome(&self, response: HttpResponse, location: Option<PathBuf>, data: Bytes) -> RequestOutcome {
        match location {
            Some(location) if response.is_success() => RequestOutcome::Response(ResponseParts {
                response,
                body: Bytes::new(),
                location: Some(location),
            }),
            Some(location) => match self.files.as_ref().map(|f| f.error_data(&location)) {
                Some(Ok(body)) => RequestOutcome::Response(ResponseParts {
                    response,
                    body: Bytes::from(body),
                    location: None,
                }),
                Some(Err(e)) => RequestOutcome::Error(ClientError::FileAccessError(e)),
                None => RequestOutcome::Error(ClientError::UnexpectedState),
            },
            None if !response.is_success() => RequestOutcome::Response(ResponseParts {
                response,
                body: data,
                location: None,
            }),
            None => RequestOutcome::Error(ClientError::UnexpectedState),
        }
    }

    fn complete(&self, outcome: RequestOutcome) {
        let cleanup = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                debug!("Ignoring duplicate terminal event");
                return;
            }
            state.outcome = Some(outcome);
            if state.phase != RequestPhase::Cancelled {
                state.phase = RequestPhase::Completed;
            }
            // Nobody to deliver to yet; release the owner now.
            if state.completion.is_none() {
                state.take_cleanup()
            } else {
                None
            }
        };
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        self.deliver_if_ready();
    }

    fn deliver_if_ready(&self) {
        let ready = {
            let mut state = self.lock();
            if state.delivered {
                return;
            }
            match (state.outcome.clone(), state.completion.take()) {
                (Some(outcome), Some((executor, handler))) => {
                    state.delivered = true;
                    Some((executor, handler, outcome, state.take_cleanup()))
                }
                (_, completion) => {
                    state.completion = completion;
                    None
                }
            }
        };

        if let Some((executor, handler, outcome, cleanup)) = ready {
            executor.execute(Box::new(move || {
                handler(outcome);
                if let Some(cleanup) = cleanup {
                    cleanup();
                }
            }));
        }
    }

    fn report_progress(&self, update: impl FnOnce(&mut Progress)) {
        let dispatch = {
            let mut state = self.lock();
            update(&mut state.progress);
            let progress = state.progress;
            state
                .progress_handler
                .as_ref()
                .map(|(executor, handler)| (Arc::clone(executor), Arc::clone(handler), progress))
        };
        if let Some((executor, handler, progress)) = dispatch {
            executor.execute(Box::new(move || handler(progress)));
        }
    }
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ApiRequest")
            .field("phase", &state.phase)
            .field("task", &state.task.as_ref().map(|t| t.task_identifier()))
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dbxkit_core::{AuthRefreshError, FilesAccessImpl, Inline, LongLivedAccessTokenProvider};
    use dbxkit_transport::{HttpRequest, MockNetworkTask};
    use http::StatusCode;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Debug)]
    struct FailingProvider(AuthRefreshError);

    #[async_trait]
    impl AccessTokenProvider for FailingProvider {
        fn access_token(&self) -> String {
            "stale".to_string()
        }

        async fn refresh_access_token_if_necessary(&self) -> RefreshOutcome {
            RefreshOutcome::Failed(self.0.clone())
        }
    }

    fn context(provider: Arc<dyn AccessTokenProvider>) -> RequestContext {
        RequestContext {
            provider,
            files: Arc::new(FilesAccessImpl::new().unwrap()),
            utility: Handle::current(),
        }
    }

    fn mock_factory(kind: TaskKind) -> (TaskFactory, Arc<MockNetworkTask>) {
        let task = Arc::new(MockNetworkTask::new(
            TaskId::new(7),
            kind,
            Some(HttpRequest::post("https://api.example.com/2/check/user")),
        ));
        let handed_out = Arc::clone(&task);
        (Box::new(move || handed_out as Arc<dyn NetworkTask>), task)
    }

    fn no_hook() -> TaskCreationHook {
        Box::new(|_, _| {})
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_staged_settings_applied_once() {
        let (factory, task) = mock_factory(TaskKind::Upload);
        let ctx = context(Arc::new(LongLivedAccessTokenProvider::new("t")));
        let request = ApiRequest::new(&ctx, factory, no_hook());
        request.set_task_description(Some("first".to_string()));
        request.set_task_description(Some("second".to_string()));
        assert_eq!(request.task_description().as_deref(), Some("second"));

        task.settled().await;
        assert_eq!(task.description_writes(), 1);
        assert_eq!(task.task_description().as_deref(), Some("second"));
        assert_eq!(task.begin_date_writes(), 0);
        assert_eq!(request.phase(), RequestPhase::InFlight);

        // Forwarded once the task exists.
        request.set_task_description(Some("third".to_string()));
        assert_eq!(task.task_description().as_deref(), Some("third"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transient_refresh_failure_skips_task_creation() {
        let (factory, task) = mock_factory(TaskKind::Data);
        let ctx = context(Arc::new(FailingProvider(AuthRefreshError::timeout("slow"))));
        let request = ApiRequest::new(&ctx, factory, no_hook());

        let (tx, rx) = mpsc::channel();
        request.set_completion_handler(Arc::new(Inline), Box::new(move |outcome| tx.send(outcome).unwrap()));

        let outcome = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RequestOutcome::Error(ClientError::OauthError(AuthRefreshError::timeout("slow")))
        );
        assert_eq!(task.resume_count(), 0);
        assert!(request.task().is_none());
        assert_eq!(request.phase(), RequestPhase::Completed);
    }

    #[test]
    fn test_failed_request_delivers_to_late_handler() {
        let request = ApiRequest::failed(ClientError::SessionShutdown);
        let (tx, rx) = mpsc::channel();
        request.set_completion_handler(Arc::new(Inline), Box::new(move |outcome| tx.send(outcome).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), RequestOutcome::Error(ClientError::SessionShutdown));

        // A second registration never fires.
        let (tx2, rx2) = mpsc::channel::<RequestOutcome>();
        request.set_completion_handler(Arc::new(Inline), Box::new(move |outcome| tx2.send(outcome).unwrap()));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_conflicting_completion_is_reported() {
        let task = Arc::new(MockNetworkTask::new(TaskId::new(1), TaskKind::Data, None));
        task.set_response(Some(HttpResponse::new(StatusCode::OK)));
        let request = ApiRequest::reconnected(task.clone(), Arc::new(FilesAccessImpl::new().unwrap()));

        let dyn_task: Arc<dyn NetworkTask> = task;
        request.handle_completion(&dyn_task, Some(TransportError::TimedOut));

        let (tx, rx) = mpsc::channel();
        request.set_completion_handler(Arc::new(Inline), Box::new(move |outcome| tx.send(outcome).unwrap()));
        assert_eq!(
            rx.try_recv().unwrap(),
            RequestOutcome::Error(ClientError::ConflictingCompletion {
                status: 200,
                error: TransportError::TimedOut
            })
        );
    }

    #[test]
    fn test_cancel_after_headers_reports_cancelled() {
        let task = Arc::new(MockNetworkTask::new(TaskId::new(3), TaskKind::Download, None));
        task.set_response(Some(HttpResponse::new(StatusCode::OK)));
        let request = ApiRequest::reconnected(task.clone(), Arc::new(FilesAccessImpl::new().unwrap()));
        request.cancel();
        assert_eq!(task.cancel_count(), 1);

        let dyn_task: Arc<dyn NetworkTask> = task;
        request.handle_completion(&dyn_task, Some(TransportError::Cancelled));

        let (tx, rx) = mpsc::channel();
        request.set_completion_handler(Arc::new(Inline), Box::new(move |outcome| tx.send(outcome).unwrap()));
        assert_eq!(
            rx.try_recv().unwrap(),
            RequestOutcome::Error(ClientError::TransportError(TransportError::Cancelled))
        );
    }

    #[test]
    fn test_handler_may_cancel_its_own_request() {
        let task = Arc::new(MockNetworkTask::new(TaskId::new(2), TaskKind::Data, None));
        task.set_response(Some(HttpResponse::new(StatusCode::OK)));
        let request = ApiRequest::reconnected(task.clone(), Arc::new(FilesAccessImpl::new().unwrap()));

        let reentrant = Arc::clone(&request);
        request.set_completion_handler(Arc::new(Inline), Box::new(move |_| reentrant.cancel()));
        let dyn_task: Arc<dyn NetworkTask> = task;
        request.handle_completion(&dyn_task, None);

        assert!(request.is_cancelled());
        assert_eq!(request.phase(), RequestPhase::Completed);
    }

    #[test]
    fn test_progress_fraction() {
        let p = Progress {
            completed: 25,
            total: Some(100),
        };
        assert_eq!(p.fraction_completed(), Some(0.25));
        assert_eq!(Progress::default().fraction_completed(), None);
    }
}
