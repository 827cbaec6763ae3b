use crate::task::{HttpRequest, NetworkTask, UploadBody};
use async_trait::async_trait;
use bytes::Bytes;
use dbxkit_core::TransportError;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMethod {
    ServerTrust,
    ClientCertificate,
    HttpBasic,
    Other(String),
}

/// A TLS or HTTP authentication challenge for one connection.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub host: String,
    pub port: u16,
    pub method: AuthenticationMethod,
    /// DER-encoded certificates presented by the server, leaf first.
    pub certificate_chain: Vec<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeDisposition {
    UseCredential,
    PerformDefaultHandling,
    CancelAuthenticationChallenge,
    RejectProtectionSpace,
}

/// Receives every callback a session produces.
///
/// Callbacks for one task are delivered in order, from a thread owned by the
/// session. Implementations must not block.
pub trait SessionDelegate: Send + Sync {
    fn did_receive_data(&self, task: &Arc<dyn NetworkTask>, data: Bytes);

    fn did_send_body_data(
        &self,
        task: &Arc<dyn NetworkTask>,
        bytes_sent: u64,
        total_bytes_sent: u64,
        total_bytes_expected: Option<u64>,
    );

    fn did_write_data(
        &self,
        task: &Arc<dyn NetworkTask>,
        bytes_written: u64,
        total_bytes_written: u64,
        total_bytes_expected: Option<u64>,
    );

    /// The download is at `location`, which the session deletes once this returns.
    fn did_finish_downloading(&self, task: &Arc<dyn NetworkTask>, location: &Path);

    /// Terminal callback; delivered exactly once per task.
    fn did_complete(&self, task: &Arc<dyn NetworkTask>, error: Option<TransportError>);

    fn did_receive_challenge(&self, challenge: &AuthChallenge) -> ChallengeDisposition;

    /// All events queued for a background session while the process was gone have been delivered.
    fn did_finish_background_events(&self);
}

/// Session holding a delegate it does not own.
///
/// Sessions reference their delegate weakly, so a delegate that owns its
/// session does not form a cycle. Events after the delegate is gone are dropped.
#[derive(Clone)]
pub struct DelegateRef {
    inner: Weak<dyn SessionDelegate>,
}

impl DelegateRef {
    pub fn new(inner: Weak<dyn SessionDelegate>) -> Self {
        Self { inner }
    }

    /// A reference that never resolves; every event is dropped.
    pub fn detached() -> Self {
        let inner: Weak<dyn SessionDelegate> = Weak::<Detached>::new();
        Self { inner }
    }

    pub fn get(&self) -> Option<Arc<dyn SessionDelegate>> {
        let delegate = self.inner.upgrade();
        if delegate.is_none() {
            trace!("Session delegate released, dropping event");
        }
        delegate
    }
}

struct Detached;

impl SessionDelegate for Detached {
    fn did_receive_data(&self, _: &Arc<dyn NetworkTask>, _: Bytes) {}
    fn did_send_body_data(&self, _: &Arc<dyn NetworkTask>, _: u64, _: u64, _: Option<u64>) {}
    fn did_write_data(&self, _: &Arc<dyn NetworkTask>, _: u64, _: u64, _: Option<u64>) {}
    fn did_finish_downloading(&self, _: &Arc<dyn NetworkTask>, _: &Path) {}
    fn did_complete(&self, _: &Arc<dyn NetworkTask>, _: Option<TransportError>) {}
    fn did_receive_challenge(&self, _: &AuthChallenge) -> ChallengeDisposition {
        ChallengeDisposition::PerformDefaultHandling
    }
    fn did_finish_background_events(&self) {}
}

impl fmt::Debug for DelegateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateRef")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Factory and owner of transport tasks.
#[async_trait]
pub trait NetworkSession: Send + Sync + fmt::Debug {
    /// Background session identifier; `None` for foreground sessions.
    fn identifier(&self) -> Option<&str>;

    fn data_task(&self, request: HttpRequest) -> Arc<dyn NetworkTask>;

    fn upload_task(&self, request: HttpRequest, body: UploadBody) -> Arc<dyn NetworkTask>;

    fn download_task(&self, request: HttpRequest) -> Arc<dyn NetworkTask>;

    /// Every task the session still owns, including ones that survived a relaunch.
    async fn all_tasks(&self) -> Vec<Arc<dyn NetworkTask>>;

    /// Cancel all tasks and refuse new work.
    fn invalidate_and_cancel(&self);
}
