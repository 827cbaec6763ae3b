pub mod client;
pub mod config;
pub mod dispatcher;
pub mod facade;
pub mod global_errors;
pub mod logging;
pub mod macros;
pub mod oauth;
pub mod reconnection;
pub mod registry;
pub mod request;

#[doc(hidden)]
pub use dbxkit_core as __route_core;

pub use client::{
    ascii_escape, ClientBuildError, TransportClient, API_ARG_HEADER, DEFAULT_USER_AGENT, PATH_ROOT_HEADER,
    SELECT_USER_HEADER,
};
pub use config::{BaseHosts, ClientConfig};
pub use dispatcher::{BackgroundEventsHandler, DefaultTrustValidator, SessionDispatcher, TrustValidator};
pub use facade::{DownloadRequestFile, DownloadRequestMemory, RpcRequest, UploadRequest, API_RESULT_HEADER};
pub use global_errors::{ErrorHandlerKey, GlobalErrorHandler, GlobalErrorHandlers};
pub use logging::{init_logging, init_test_logging, LogConfig};
pub use oauth::OAuthTokenRefresher;
pub use reconnection::{ReconnectParts, ReconnectionFailure, RouteTable};
pub use registry::{RequestMap, DEFAULT_COMPACTION_THRESHOLD};
pub use request::{
    ApiRequest, Progress, RequestContext, RequestOutcome, RequestPhase, ResponseParts, StagedSettings,
};
