// panelbackup/src/backup/requester.rs
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::{BackupJob, JobRef, JobStatus};
use crate::config::{CpanelConfig, Secret};
use crate::errors::RequestError;
use crate::utils::clock::Clock;

/// Status of a job as reported by the control panel itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteJobStatus {
    Running,
    Completed,
    Failed(String),
}

/// Control-panel operations the core depends on.
#[async_trait]
pub trait ControlPanel: Send + Sync {
    /// Starts a full-account backup. Returns the panel's job id when it hands one out.
    async fn start_backup(&self) -> Result<Option<String>, RequestError>;

    /// `Ok(None)` when the panel offers no status for this kind of job reference.
    async fn job_status(&self, job: &JobRef) -> Result<Option<RemoteJobStatus>, RequestError>;
}

/// Issues exactly one "start backup" call per `request`; retries are the orchestrator's call.
pub struct BackupRequester {
    panel: Arc<dyn ControlPanel>,
    clock: Arc<dyn Clock>,
}

impl BackupRequester {
    pub fn new(panel: Arc<dyn ControlPanel>, clock: Arc<dyn Clock>) -> Self {
        Self { panel, clock }
    }

    pub async fn request(&self) -> Result<BackupJob, RequestError> {
        // Taken before the call so the backup file can never predate the anchor.
        let requested_at = self.clock.now();
        let job_id = self.panel.start_backup().await?;
        let reference = match job_id {
            Some(id) => JobRef::Id(id),
            None => JobRef::Anchor(requested_at),
        };
        info!(?reference, "Full backup requested");
        Ok(BackupJob {
            reference,
            requested_at,
            status: JobStatus::Requested,
            failure: None,
        })
    }
}

/// Stand-in for a panel client that could not be built. Every call fails with the setup error.
pub struct UnavailablePanel {
    reason: String,
}

impl UnavailablePanel {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl ControlPanel for UnavailablePanel {
    async fn start_backup(&self) -> Result<Option<String>, RequestError> {
        Err(RequestError::Setup(self.reason.clone()))
    }

    async fn job_status(&self, _job: &JobRef) -> Result<Option<RemoteJobStatus>, RequestError> {
        Err(RequestError::Setup(self.reason.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct UapiResponse {
    status: i64,
    #[serde(default)]
    errors: Option<Vec<String>>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// cPanel UAPI client: `Backup::fullbackup_to_homedir` with API-token auth.
pub struct CpanelClient {
    http: reqwest::Client,
    endpoint: Url,
    username: String,
    api_token: Secret,
    notify_email: Option<String>,
    include_homedir: bool,
}

impl CpanelClient {
    pub fn new(config: &CpanelConfig) -> Result<Self, RequestError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let endpoint = config.url.join("/execute/Backup/fullbackup_to_homedir")?;
        Ok(Self {
            http,
            endpoint,
            username: config.username.clone(),
            api_token: config.api_token.clone(),
            notify_email: config.notify_email.clone(),
            include_homedir: config.include_homedir,
        })
    }
}

#[async_trait]
impl ControlPanel for CpanelClient {
    async fn start_backup(&self) -> Result<Option<String>, RequestError> {
        info!(endpoint = %self.endpoint, "Initializing full backup creation in cPanel");

        let mut form = vec![(
            "homedir",
            if self.include_homedir { "include" } else { "skip" }.to_string(),
        )];
        if let Some(email) = &self.notify_email {
            form.push(("email", email.clone()));
        }

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(
                reqwest::header::AUTHORIZATION,
                format!("cpanel {}:{}", self.username, self.api_token.expose()),
            )
            .form(&form)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        interpret_uapi_response(status, &body)
    }

    async fn job_status(&self, _job: &JobRef) -> Result<Option<RemoteJobStatus>, RequestError> {
        // fullbackup_to_homedir is fire-and-forget; UAPI exposes no per-job status.
        Ok(None)
    }
}

/// Checks HTTP 200 plus UAPI `status == 1` and extracts `data.pid` when present.
fn interpret_uapi_response(http_status: u16, body: &str) -> Result<Option<String>, RequestError> {
    if http_status != 200 {
        warn!(expected = 200, received = http_status, "Unexpected response code from cPanel");
        return Err(RequestError::UnexpectedStatus { status: http_status });
    }

    let parsed: UapiResponse = serde_json::from_str(body)
        .map_err(|e| RequestError::InvalidResponse(format!("not a UAPI JSON document: {}", e)))?;
    if parsed.status != 1 {
        let errors = parsed.errors.unwrap_or_default();
        let reason = if errors.is_empty() {
            format!("status {}", parsed.status)
        } else {
            errors.join("; ")
        };
        return Err(RequestError::Rejected(reason));
    }

    let pid = parsed.data.as_ref().and_then(|d| d.get("pid")).and_then(|pid| {
        pid.as_str()
            .map(str::to_string)
            .or_else(|| pid.as_u64().map(|n| n.to_string()))
    });
    Ok(pid)
}
