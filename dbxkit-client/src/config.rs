use dbxkit_core::{RouteHost, SCHEMA_VERSION};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_HOST: &str = "https://api.dropbox.com";
pub const DEFAULT_CONTENT_HOST: &str = "https://api-content.dropbox.com";
pub const DEFAULT_NOTIFY_HOST: &str = "https://notify.dropboxapi.com";

/// Base URLs per route host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BaseHosts {
    pub api: String,
    pub content: String,
    pub notify: String,
}

impl Default for BaseHosts {
    fn default() -> Self {
        BaseHosts {
            api: DEFAULT_API_HOST.to_string(),
            content: DEFAULT_CONTENT_HOST.to_string(),
            notify: DEFAULT_NOTIFY_HOST.to_string(),
        }
    }
}

impl BaseHosts {
    /// Point every host at one base URL, e.g. a local mock server.
    pub fn all(base: impl Into<String>) -> Self {
        let base = base.into();
        BaseHosts {
            api: base.clone(),
            content: base.clone(),
            notify: base,
        }
    }

    pub fn url_for(&self, host: RouteHost) -> &str {
        match host {
            RouteHost::Api => &self.api,
            RouteHost::Content => &self.content,
            RouteHost::Notify => &self.notify,
        }
    }
}

/// Client settings. Collaborators (token provider, session, files access) are
/// passed to the client separately.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub hosts: BaseHosts,
    /// Appended in front of the default user agent.
    pub user_agent: Option<String>,
    /// `Dropbox-Api-Select-User` for team clients acting as a member.
    pub select_user: Option<String>,
    /// JSON-encoded `Dropbox-Api-Path-Root`.
    pub path_root: Option<String>,
    /// Background session identifier; `None` for a foreground session.
    pub session_identifier: Option<String>,
    /// Per-request timeout of the HTTP session.
    #[serde(with = "secs_option")]
    pub timeout: Option<Duration>,
    /// Where transport downloads land before they are moved.
    pub download_dir: Option<PathBuf>,
    /// Written into persisted reconnection info.
    pub schema_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            hosts: BaseHosts::default(),
            user_agent: None,
            select_user: None,
            path_root: None,
            session_identifier: None,
            timeout: Some(Duration::from_secs(100)),
            download_dir: None,
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_hosts(mut self, hosts: BaseHosts) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_select_user(mut self, member_id: impl Into<String>) -> Self {
        self.select_user = Some(member_id.into());
        self
    }

    pub fn with_path_root(mut self, path_root: impl Into<String>) -> Self {
        self.path_root = Some(path_root.into());
        self
    }

    pub fn with_session_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.session_identifier = Some(identifier.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    pub fn is_background(&self) -> bool {
        self.session_identifier.is_some()
    }
}

mod secs_option {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
