// Reconnection descriptors
// A compact identity string stored in a transport task's persisted description,
// letting a relaunched process rebuild the logical request around a surviving task.

use crate::error::{ReconnectionError, ReconnectionErrorKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Literal token between the schema version and the JSON payload.
///
/// Every `/` in the payload is written as the JSON escape `\/`, so the
/// separator can never occur inside it.
pub const RECONNECTION_SEPARATOR: &str = "#?///?#";

/// Schema version written by this build.
pub const SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardInfo {
    pub route_name: String,
    pub route_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_provided_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFileInfo {
    pub route_name: String,
    pub route_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_provided_info: Option<String>,
    pub destination: PathBuf,
    pub overwrite: bool,
}

/// What a background task needs to be rebuilt after relaunch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistedRequestInfo {
    Upload(StandardInfo),
    DownloadFile(DownloadFileInfo),
}

impl PersistedRequestInfo {
    pub fn upload(route_namespace: impl Into<String>, route_name: impl Into<String>) -> Self {
        PersistedRequestInfo::Upload(StandardInfo {
            route_name: route_name.into(),
            route_namespace: route_namespace.into(),
            client_provided_info: None,
        })
    }

    pub fn download_file(
        route_namespace: impl Into<String>,
        route_name: impl Into<String>,
        destination: impl Into<PathBuf>,
        overwrite: bool,
    ) -> Self {
        PersistedRequestInfo::DownloadFile(DownloadFileInfo {
            route_name: route_name.into(),
            route_namespace: route_namespace.into(),
            client_provided_info: None,
            destination: destination.into(),
            overwrite,
        })
    }

    pub fn route_name(&self) -> &str {
        match self {
            PersistedRequestInfo::Upload(info) => &info.route_name,
            PersistedRequestInfo::DownloadFile(info) => &info.route_name,
        }
    }

    pub fn route_namespace(&self) -> &str {
        match self {
            PersistedRequestInfo::Upload(info) => &info.route_namespace,
            PersistedRequestInfo::DownloadFile(info) => &info.route_namespace,
        }
    }

    /// Route lookup key, e.g. `files/upload_session/append_v2`.
    pub fn namespace_route_name(&self) -> String {
        format!("{}/{}", self.route_namespace(), self.route_name())
    }

    pub fn client_provided_info(&self) -> Option<&str> {
        match self {
            PersistedRequestInfo::Upload(info) => info.client_provided_info.as_deref(),
            PersistedRequestInfo::DownloadFile(info) => info.client_provided_info.as_deref(),
        }
    }

    pub fn with_client_info(mut self, info: Option<String>) -> Self {
        match &mut self {
            PersistedRequestInfo::Upload(i) => i.client_provided_info = info,
            PersistedRequestInfo::DownloadFile(i) => i.client_provided_info = info,
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Could not encode persisted request info: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes and decodes `<schemaVersion><separator><jsonPayload>` strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionCodec {
    schema_version: String,
}

impl ReconnectionCodec {
    pub fn new(schema_version: impl Into<String>) -> Self {
        Self {
            schema_version: schema_version.into(),
        }
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn encode(&self, info: &PersistedRequestInfo) -> Result<String, EncodeError> {
        let json = serde_json::to_string(info)?.replace('/', "\\/");
        Ok(format!("{}{}{}", self.schema_version, RECONNECTION_SEPARATOR, json))
    }

    /// Decode a task description. The version is compared before the payload is parsed.
    pub fn decode(&self, description: Option<&str>) -> Result<PersistedRequestInfo, ReconnectionError> {
        let fail = |kind| ReconnectionError::new(kind, description.map(str::to_string));

        let description = description.ok_or_else(|| fail(ReconnectionErrorKind::NoPersistedInfo))?;
        let (version, payload) = split_description(description)
            .ok_or_else(|| fail(ReconnectionErrorKind::BadPersistedStringFormat))?;

        if version != self.schema_version {
            debug!(found = version, expected = %self.schema_version, "Persisted request info version mismatch");
            return Err(fail(ReconnectionErrorKind::VersionMismatch));
        }

        serde_json::from_str(payload).map_err(|e| {
            debug!(error = %e, "Persisted request info payload is malformed");
            fail(ReconnectionErrorKind::BadPersistedStringFormat)
        })
    }
}

impl Default for ReconnectionCodec {
    fn default() -> Self {
        Self::new(SCHEMA_VERSION)
    }
}

/// Split into exactly two components, as the encoder writes them.
fn split_description(description: &str) -> Option<(&str, &str)> {
    let (version, payload) = description.split_once(RECONNECTION_SEPARATOR)?;
    if payload.contains(RECONNECTION_SEPARATOR) {
        return None;
    }
    Some((version, payload))
}
