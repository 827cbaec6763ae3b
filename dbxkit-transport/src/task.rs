// Transport tasks
// One task is one HTTP exchange owned by a session. Tasks created in a
// background session may outlive the process that created them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dbxkit_core::{TaskId, TransportError};
use futures::stream::BoxStream;
use http::{HeaderMap, Method, StatusCode};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Response body delivered in memory.
    Data,
    /// Request body from memory, a file or a stream; response body in memory.
    Upload,
    /// Response body written to a file owned by the transport.
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Suspended,
    Running,
    Canceling,
    Completed,
}

/// The request a task was created with.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    /// Inline body of data tasks. Upload tasks take theirs from `UploadBody`.
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Status line and headers of a received response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

pub enum UploadBody {
    Data(Bytes),
    File(PathBuf),
    Stream(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

impl From<Bytes> for UploadBody {
    fn from(bytes: Bytes) -> Self {
        UploadBody::Data(bytes)
    }
}

impl From<Vec<u8>> for UploadBody {
    fn from(bytes: Vec<u8>) -> Self {
        UploadBody::Data(Bytes::from(bytes))
    }
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadBody::Data(bytes) => f.debug_tuple("Data").field(&bytes.len()).finish(),
            UploadBody::File(path) => f.debug_tuple("File").field(path).finish(),
            UploadBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Handle to a unit of network work.
///
/// Tasks start suspended. `resume` and `cancel` may be called from any thread;
/// results are reported to the session's delegate.
pub trait NetworkTask: Send + Sync + fmt::Debug {
    fn task_identifier(&self) -> TaskId;

    fn kind(&self) -> TaskKind;

    fn state(&self) -> TaskState;

    fn resume(&self);

    fn cancel(&self);

    /// Status and headers, once a response has been received.
    fn response(&self) -> Option<HttpResponse>;

    fn error(&self) -> Option<TransportError>;

    fn original_request(&self) -> Option<HttpRequest>;

    /// Opaque string persisted with the task for background sessions.
    fn task_description(&self) -> Option<String>;

    fn set_task_description(&self, description: Option<String>);

    /// The task will not start before this date.
    fn earliest_begin_date(&self) -> Option<DateTime<Utc>>;

    fn set_earliest_begin_date(&self, date: Option<DateTime<Utc>>);
}
