// Session event dispatcher
// The single delegate of a transport session. Every callback is resolved to
// its logical request through the registry and forwarded synchronously, so
// per-task ordering is whatever the transport delivers.

use crate::registry::RequestMap;
use crate::request::{ApiRequest, RequestContext, TaskCreationHook, TaskFactory};
use bytes::Bytes;
use dbxkit_core::{ClientError, TransportError};
use dbxkit_transport::{
    AuthChallenge, ChallengeDisposition, DelegateRef, HttpRequest, NetworkSession, NetworkTask,
    SessionDelegate, UploadBody,
};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info};

/// Decides TLS and HTTP authentication challenges for a whole session.
pub trait TrustValidator: Send + Sync + fmt::Debug {
    fn validate(&self, challenge: &AuthChallenge) -> ChallengeDisposition;
}

/// Leaves every challenge to the platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTrustValidator;

impl TrustValidator for DefaultTrustValidator {
    fn validate(&self, _challenge: &AuthChallenge) -> ChallengeDisposition {
        ChallengeDisposition::PerformDefaultHandling
    }
}

pub type BackgroundEventsHandler = Box<dyn FnOnce() + Send>;

pub struct SessionDispatcher {
    ctx: RequestContext,
    session: Arc<dyn NetworkSession>,
    requests: RequestMap,
    trust: Mutex<Arc<dyn TrustValidator>>,
    background_events: Mutex<Option<BackgroundEventsHandler>>,
    shut_down: AtomicBool,
    this: Weak<SessionDispatcher>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionDispatcher {
    /// Build the dispatcher and the session it delegates for.
    ///
    /// `make_session` receives a weak reference to the dispatcher, which the
    /// session uses for all of its callbacks.
    pub fn new(
        ctx: RequestContext,
        make_session: impl FnOnce(DelegateRef) -> Arc<dyn NetworkSession>,
    ) -> Arc<Self> {
        Self::with_registry(ctx, RequestMap::new(), make_session)
    }

    pub fn with_registry(
        ctx: RequestContext,
        requests: RequestMap,
        make_session: impl FnOnce(DelegateRef) -> Arc<dyn NetworkSession>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let delegate: Weak<dyn SessionDelegate> = this.clone();
            let session = make_session(DelegateRef::new(delegate));
            debug!(identifier = ?session.identifier(), "Session dispatcher created");
            Self {
                ctx,
                session,
                requests,
                trust: Mutex::new(Arc::new(DefaultTrustValidator)),
                background_events: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                this: this.clone(),
            }
        })
    }

    pub fn identifier(&self) -> Option<&str> {
        self.session.identifier()
    }

    pub fn is_background(&self) -> bool {
        self.session.identifier().is_some()
    }

    pub fn session(&self) -> &Arc<dyn NetworkSession> {
        &self.session
    }

    pub fn requests(&self) -> &RequestMap {
        &self.requests
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn set_trust_validator(&self, validator: Arc<dyn TrustValidator>) {
        *lock(&self.trust) = validator;
    }

    /// Called once the session reports that all queued background events were delivered.
    pub fn set_background_events_handler(&self, handler: BackgroundEventsHandler) {
        *lock(&self.background_events) = Some(handler);
    }

    /// `make_request` runs after the credential refresh, so it sees the fresh token.
    pub fn data_request(&self, make_request: impl FnOnce() -> HttpRequest + Send + 'static) -> Arc<ApiRequest> {
        self.create_request(move |session| session.data_task(make_request()))
    }

    pub fn upload_request(
        &self,
        make_request: impl FnOnce() -> HttpRequest + Send + 'static,
        body: UploadBody,
    ) -> Arc<ApiRequest> {
        self.create_request(move |session| session.upload_task(make_request(), body))
    }

    pub fn download_file_request(
        &self,
        make_request: impl FnOnce() -> HttpRequest + Send + 'static,
    ) -> Arc<ApiRequest> {
        self.create_request(move |session| session.download_task(make_request()))
    }

    fn create_request(
        &self,
        make_task: impl FnOnce(&dyn NetworkSession) -> Arc<dyn NetworkTask> + Send + 'static,
    ) -> Arc<ApiRequest> {
        if self.is_shut_down() {
            debug!("Request created after session shutdown");
            return ApiRequest::failed(ClientError::SessionShutdown);
        }

        let session = Arc::clone(&self.session);
        let factory: TaskFactory = Box::new(move || make_task(session.as_ref()));
        let this = self.this.clone();
        let on_task_creation: TaskCreationHook = Box::new(move |request, task| {
            if let Some(dispatcher) = this.upgrade() {
                dispatcher.requests.set(request, task.task_identifier());
            }
        });
        ApiRequest::new(&self.ctx, factory, on_task_creation)
    }

    /// Requests for tasks that survived a relaunch, rebuilt in flight.
    ///
    /// Untracked surviving tasks are wrapped first. The returned requests are
    /// owned by the caller afterwards; the registry only keeps weak references.
    pub async fn pending_reconnection_requests(&self) -> Vec<Arc<ApiRequest>> {
        let tasks = self.session.all_tasks().await;
        for task in tasks {
            let id = task.task_identifier();
            if self.requests.get(id).is_none() {
                self.requests
                    .get_or_insert_pending_reconnection(id, || self.reconnected(&task));
            }
        }

        let mut pending = self.requests.take_pending_reconnection_requests();
        pending.sort_by_key(|(id, _)| *id);
        info!(target: "dbxkit::background", count = pending.len(), "Collected pending reconnection requests");
        pending.into_iter().map(|(_, request)| request).collect()
    }

    /// Cancel every task and refuse new requests. Registered requests keep
    /// receiving their cancellation callbacks.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(identifier = ?self.identifier(), "Shutting down session");
        self.session.invalidate_and_cancel();
    }

    fn reconnected(&self, task: &Arc<dyn NetworkTask>) -> Arc<ApiRequest> {
        ApiRequest::reconnected(Arc::clone(task), Arc::clone(&self.ctx.files))
    }

    fn request_for(&self, task: &Arc<dyn NetworkTask>) -> Option<Arc<ApiRequest>> {
        let id = task.task_identifier();
        if let Some(request) = self.requests.get(id) {
            return Some(request);
        }
        if self.is_background() {
            debug!(target: "dbxkit::background", task_id = %id, "Event for untracked task, holding it for reconnection");
            Some(self.requests.get_or_insert_pending_reconnection(id, || self.reconnected(task)))
        } else {
            error!(task_id = %id, "No request registered for task, dropping event");
            None
        }
    }
}

impl SessionDelegate for SessionDispatcher {
    fn did_receive_data(&self, task: &Arc<dyn NetworkTask>, data: Bytes) {
        if let Some(request) = self.request_for(task) {
            request.handle_received_data(data);
        }
    }

    fn did_send_body_data(
        &self,
        task: &Arc<dyn NetworkTask>,
        _bytes_sent: u64,
        total_bytes_sent: u64,
        total_bytes_expected: Option<u64>,
    ) {
        if let Some(request) = self.request_for(task) {
            request.handle_sent_body_data(total_bytes_sent, total_bytes_expected);
        }
    }

    fn did_write_data(
        &self,
        task: &Arc<dyn NetworkTask>,
        _bytes_written: u64,
        total_bytes_written: u64,
        total_bytes_expected: Option<u64>,
    ) {
        if let Some(request) = self.request_for(task) {
            request.handle_wrote_download_data(total_bytes_written, total_bytes_expected);
        }
    }

    fn did_finish_downloading(&self, task: &Arc<dyn NetworkTask>, location: &Path) {
        if let Some(request) = self.request_for(task) {
            request.handle_download_finished(location);
        }
    }

    fn did_complete(&self, task: &Arc<dyn NetworkTask>, error: Option<TransportError>) {
        if let Some(request) = self.request_for(task) {
            request.handle_completion(task, error);
        }
    }

    fn did_receive_challenge(&self, challenge: &AuthChallenge) -> ChallengeDisposition {
        let validator = Arc::clone(&*lock(&self.trust));
        let disposition = validator.validate(challenge);
        debug!(host = %challenge.host, method = ?challenge.method, ?disposition, "Authentication challenge");
        disposition
    }

    fn did_finish_background_events(&self) {
        let handler = lock(&self.background_events).take();
        match handler {
            Some(handler) => {
                info!(target: "dbxkit::background", identifier = ?self.identifier(), "Background events delivered");
                handler();
            }
            None => debug!(target: "dbxkit::background", "Background events delivered with no handler set"),
        }
    }
}

impl fmt::Debug for SessionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDispatcher")
            .field("session", &self.session)
            .field("requests", &self.requests.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
