pub mod error;
pub mod executor;
pub mod files;
pub mod ids;
pub mod reconnect;
pub mod route;
pub mod token;

pub use error::{
    ApiErrorDetails, AuthRefreshError, CallError, ClientError, FilesAccessError,
    LocalizedUserMessage, OAuth2Error, ReconnectionError, ReconnectionErrorKind, TransportError,
};
pub use executor::{Executor, Inline, Job, RuntimeExecutor, SerialQueue};
pub use files::{FilesAccess, FilesAccessImpl};
pub use ids::{TaskId, TaskIdAllocator};
pub use reconnect::{
    DownloadFileInfo, PersistedRequestInfo, ReconnectionCodec, StandardInfo,
    RECONNECTION_SEPARATOR, SCHEMA_VERSION,
};
pub use route::{AuthType, Route, RouteAttributes, RouteHost, RouteStyle};
pub use token::{
    AccessToken, AccessTokenProvider, AccessTokenRefresher, LongLivedAccessTokenProvider,
    RefreshOutcome, ShortLivedAccessTokenProvider,
};
