// Shared fixtures: a dispatcher over the in-memory session and scripted token providers.
#![allow(dead_code)]

use async_trait::async_trait;
use dbxkit_client::{RequestContext, SessionDispatcher};
use dbxkit_core::{AccessTokenProvider, FilesAccessImpl, RefreshOutcome};
use dbxkit_transport::{MockNetworkSession, NetworkSession};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};

pub struct Harness {
    pub dispatcher: Arc<SessionDispatcher>,
    pub session: Arc<MockNetworkSession>,
    pub files: Arc<FilesAccessImpl>,
    pub dir: tempfile::TempDir,
}

pub fn harness(identifier: Option<&str>, provider: Arc<dyn AccessTokenProvider>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let files = Arc::new(FilesAccessImpl::with_temp_folder(dir.path().join("tmp")).unwrap());
    let ctx = RequestContext {
        provider,
        files: files.clone(),
        utility: Handle::current(),
    };

    let mut created = None;
    let dispatcher = SessionDispatcher::new(ctx, |delegate| {
        let session = Arc::new(MockNetworkSession::new(identifier, delegate));
        created = Some(Arc::clone(&session));
        session as Arc<dyn NetworkSession>
    });

    Harness {
        dispatcher,
        session: created.unwrap(),
        files,
        dir,
    }
}

/// Returns the same outcome on every refresh and counts the calls.
#[derive(Debug)]
pub struct ScriptedProvider {
    pub outcome: RefreshOutcome,
    pub calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(outcome: RefreshOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccessTokenProvider for ScriptedProvider {
    fn access_token(&self) -> String {
        "scripted-token".to_string()
    }

    async fn refresh_access_token_if_necessary(&self) -> RefreshOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// Holds every refresh until the test opens the gate.
#[derive(Debug)]
pub struct GatedProvider {
    gate: Semaphore,
}

impl GatedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { gate: Semaphore::new(0) })
    }

    pub fn open(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl AccessTokenProvider for GatedProvider {
    fn access_token(&self) -> String {
        "gated-token".to_string()
    }

    async fn refresh_access_token_if_necessary(&self) -> RefreshOutcome {
        let _permit = self.gate.acquire().await;
        RefreshOutcome::NotNeeded
    }
}

/// A channel whose sender can be moved into a handler.
pub fn outcome_channel<T: Send + 'static>() -> (impl FnOnce(T) + Send + 'static, mpsc::UnboundedReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |value| tx.send(value).unwrap(), rx)
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Let spawned work run; used before asserting that something did not happen.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
