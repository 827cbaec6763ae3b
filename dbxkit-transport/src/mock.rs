// In-memory session for tests
// Tasks never touch the network; the test drives every callback explicitly.

use crate::session::{AuthChallenge, ChallengeDisposition, DelegateRef, NetworkSession};
use crate::task::{HttpRequest, HttpResponse, NetworkTask, TaskKind, TaskState, UploadBody};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dbxkit_core::{TaskId, TaskIdAllocator, TransportError};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug)]
struct MockTaskInner {
    state: TaskState,
    response: Option<HttpResponse>,
    error: Option<TransportError>,
    description: Option<String>,
    earliest_begin_date: Option<DateTime<Utc>>,
    resume_count: usize,
    cancel_count: usize,
    description_writes: usize,
    begin_date_writes: usize,
}

#[derive(Debug)]
pub struct MockNetworkTask {
    id: TaskId,
    kind: TaskKind,
    request: Option<HttpRequest>,
    upload_body: Option<String>,
    inner: Mutex<MockTaskInner>,
    // Bumped on every resume or cancel.
    transitions: watch::Sender<usize>,
}

impl MockNetworkTask {
    pub fn new(id: TaskId, kind: TaskKind, request: Option<HttpRequest>) -> Self {
        Self {
            id,
            kind,
            request,
            upload_body: None,
            inner: Mutex::new(MockTaskInner {
                state: TaskState::Suspended,
                response: None,
                error: None,
                description: None,
                earliest_begin_date: None,
                resume_count: 0,
                cancel_count: 0,
                description_writes: 0,
                begin_date_writes: 0,
            }),
            transitions: watch::channel(0).0,
        }
    }

    fn with_upload_body(mut self, body: &UploadBody) -> Self {
        self.upload_body = Some(format!("{:?}", body));
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockTaskInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resume_count(&self) -> usize {
        self.lock().resume_count
    }

    pub fn cancel_count(&self) -> usize {
        self.lock().cancel_count
    }

    /// How many times the description was written after creation.
    pub fn description_writes(&self) -> usize {
        self.lock().description_writes
    }

    pub fn begin_date_writes(&self) -> usize {
        self.lock().begin_date_writes
    }

    /// Debug rendering of the upload body the task was created with.
    pub fn upload_body(&self) -> Option<&str> {
        self.upload_body.as_deref()
    }

    pub fn set_response(&self, response: Option<HttpResponse>) {
        self.lock().response = response;
    }

    pub fn set_state(&self, state: TaskState) {
        self.lock().state = state;
    }

    /// Wait until the task has been resumed or cancelled at least once.
    pub async fn settled(&self) {
        let mut rx = self.transitions.subscribe();
        let _ = rx.wait_for(|n| *n > 0).await;
    }

    fn bump(&self) {
        self.transitions.send_modify(|n| *n += 1);
    }
}

impl NetworkTask for MockNetworkTask {
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
            inner.resume_count += 1;
            if inner.state == TaskState::Suspended {
                inner.state = TaskState::Running;
            }
        }
        self.bump();
    }

    fn cancel(&self) {
        {
            let mut inner = self.lock();
            inner.cancel_count += 1;
            if inner.state != TaskState::Completed {
                inner.state = TaskState::Canceling;
                inner.error = Some(TransportError::Cancelled);
            }
        }
        self.bump();
    }

    fn response(&self) -> Option<HttpResponse> {
        self.lock().response.clone()
    }

    fn error(&self) -> Option<TransportError> {
        self.lock().error.clone()
    }

    fn original_request(&self) -> Option<HttpRequest> {
        self.request.clone()
    }

    fn task_description(&self) -> Option<String> {
        self.lock().description.clone()
    }

    fn set_task_description(&self, description: Option<String>) {
        let mut inner = self.lock();
        inner.description = description;
        inner.description_writes += 1;
    }

    fn earliest_begin_date(&self) -> Option<DateTime<Utc>> {
        self.lock().earliest_begin_date
    }

    fn set_earliest_begin_date(&self, date: Option<DateTime<Utc>>) {
        let mut inner = self.lock();
        inner.earliest_begin_date = date;
        inner.begin_date_writes += 1;
    }
}

/// Session whose tasks are completed by the test.
#[derive(Debug)]
pub struct MockNetworkSession {
    identifier: Option<String>,
    delegate: DelegateRef,
    ids: TaskIdAllocator,
    tasks: Mutex<Vec<Arc<MockNetworkTask>>>,
    created: watch::Sender<usize>,
    invalidated: AtomicBool,
}

impl MockNetworkSession {
    pub fn new(identifier: Option<&str>, delegate: DelegateRef) -> Self {
        Self {
            identifier: identifier.map(str::to_string),
            delegate,
            ids: TaskIdAllocator::new(),
            tasks: Mutex::new(Vec::new()),
            created: watch::channel(0).0,
            invalidated: AtomicBool::new(false),
        }
    }

    fn register(&self, task: MockNetworkTask) -> Arc<MockNetworkTask> {
        let task = Arc::new(task);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&task));
        self.created.send_modify(|n| *n += 1);
        debug!(task_id = %task.task_identifier(), kind = ?task.kind(), "Mock task created");
        task
    }

    /// Simulate a task that survived a process relaunch.
    pub fn add_surviving_task(&self, kind: TaskKind, description: Option<String>) -> Arc<MockNetworkTask> {
        let task = MockNetworkTask::new(self.ids.allocate(), kind, None);
        {
            let mut inner = task.lock();
            inner.state = TaskState::Running;
            inner.description = description;
        }
        self.register(task)
    }

    pub fn tasks(&self) -> Vec<Arc<MockNetworkTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<MockNetworkTask>> {
        self.tasks().into_iter().find(|t| t.task_identifier() == id)
    }

    /// Wait until at least `count` tasks have been created.
    pub async fn wait_for_tasks(&self, count: usize) -> Vec<Arc<MockNetworkTask>> {
        let mut rx = self.created.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
        self.tasks()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub fn deliver_data(&self, task: &Arc<MockNetworkTask>, data: impl Into<Bytes>) {
        let dyn_task: Arc<dyn NetworkTask> = task.clone();
        if let Some(delegate) = self.delegate.get() {
            delegate.did_receive_data(&dyn_task, data.into());
        }
    }

    pub fn deliver_upload_progress(&self, task: &Arc<MockNetworkTask>, sent: u64, total_sent: u64, expected: Option<u64>) {
        let dyn_task: Arc<dyn NetworkTask> = task.clone();
        if let Some(delegate) = self.delegate.get() {
            delegate.did_send_body_data(&dyn_task, sent, total_sent, expected);
        }
    }

    pub fn deliver_download_progress(&self, task: &Arc<MockNetworkTask>, written: u64, total_written: u64, expected: Option<u64>) {
        let dyn_task: Arc<dyn NetworkTask> = task.clone();
        if let Some(delegate) = self.delegate.get() {
            delegate.did_write_data(&dyn_task, written, total_written, expected);
        }
    }

    pub fn deliver_download(&self, task: &Arc<MockNetworkTask>, location: &Path) {
        let dyn_task: Arc<dyn NetworkTask> = task.clone();
        if let Some(delegate) = self.delegate.get() {
            delegate.did_finish_downloading(&dyn_task, location);
        }
    }

    /// Finish the task and deliver the terminal callback.
    pub fn complete(&self, task: &Arc<MockNetworkTask>, response: Option<HttpResponse>, error: Option<TransportError>) {
        {
            let mut inner = task.lock();
            inner.state = TaskState::Completed;
            inner.response = response;
            inner.error = error.clone();
        }
        let dyn_task: Arc<dyn NetworkTask> = task.clone();
        if let Some(delegate) = self.delegate.get() {
            delegate.did_complete(&dyn_task, error);
        }
    }

    pub fn challenge(&self, challenge: &AuthChallenge) -> Option<ChallengeDisposition> {
        self.delegate.get().map(|d| d.did_receive_challenge(challenge))
    }

    pub fn finish_background_events(&self) {
        if let Some(delegate) = self.delegate.get() {
            delegate.did_finish_background_events();
        }
    }
}

#[async_trait]
impl NetworkSession for MockNetworkSession {
    fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    fn data_task(&self, request: HttpRequest) -> Arc<dyn NetworkTask> {
        self.register(MockNetworkTask::new(self.ids.allocate(), TaskKind::Data, Some(request)))
    }

    fn upload_task(&self, request: HttpRequest, body: UploadBody) -> Arc<dyn NetworkTask> {
        self.register(MockNetworkTask::new(self.ids.allocate(), TaskKind::Upload, Some(request)).with_upload_body(&body))
    }

    fn download_task(&self, request: HttpRequest) -> Arc<dyn NetworkTask> {
        self.register(MockNetworkTask::new(self.ids.allocate(), TaskKind::Download, Some(request)))
    }

    async fn all_tasks(&self) -> Vec<Arc<dyn NetworkTask>> {
        self.tasks()
            .into_iter()
            .filter(|t| t.state() != TaskState::Completed)
            .map(|t| t as Arc<dyn NetworkTask>)
            .collect()
    }

    fn invalidate_and_cancel(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        for task in self.tasks() {
            if task.state() != TaskState::Completed {
                task.cancel();
            }
        }
    }
}
