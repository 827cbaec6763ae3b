pub mod http;
pub mod mock;
pub mod session;
pub mod task;

pub use http::{HttpSession, HttpSessionConfig, HttpTask};
pub use mock::{MockNetworkSession, MockNetworkTask};
pub use session::{
    AuthChallenge, AuthenticationMethod, ChallengeDisposition, DelegateRef, NetworkSession,
    SessionDelegate,
};
pub use task::{HttpRequest, HttpResponse, NetworkTask, TaskKind, TaskState, UploadBody};
