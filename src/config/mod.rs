// panelbackup/src/config/mod.rs
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::retention::RetentionPolicy;

const DEFAULT_POLL_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_POLL_CEILING_SECS: u64 = 300;
const DEFAULT_LOCATE_WAIT_SECS: u64 = 120;
const DEFAULT_CLOCK_SKEW_SECS: u64 = 120;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TRANSFER_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_SECS: u64 = 5;
const DEFAULT_RETRY_CEILING_SECS: u64 = 120;
const DEFAULT_CHUNK_MIB: u64 = 64;
/// S3 rejects multipart parts below 5 MiB (except the last one).
const MIN_CHUNK_MIB: u64 = 5;
const DEFAULT_LOG_DIR: &str = "logs";

/// Default cPanel naming: `backup-8.17.2024_17-46-55_<username>.tar.gz`.
const DEFAULT_ARTIFACT_PATTERN: &str =
    r"backup-\d{1,2}\.\d{1,2}\.\d{4}_\d{2}-\d{2}-\d{2}_{username}\.tar\.gz";

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonCpanelConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub api_token: Option<String>,
    pub notify_email: Option<String>,
    pub include_homedir: Option<bool>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackupOptions {
    pub search_dir: Option<PathBuf>,
    pub artifact_pattern: Option<String>,
    pub poll_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub poll_interval_ceiling_secs: Option<u64>,
    pub locate_wait_secs: Option<u64>,
    pub clock_skew_secs: Option<u64>,
    pub compute_checksum: Option<bool>,
    pub request_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTransferOptions {
    pub max_concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_base_delay_secs: Option<u64>,
    pub retry_ceiling_secs: Option<u64>,
    pub chunk_size_mib: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRetentionOptions {
    pub policy: Option<RetentionPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonObjectStoreConfig {
    pub name: Option<String>,
    pub bucket_name: Option<String>,
    pub folder_prefix: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub profile: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub access_key_id_env: Option<String>,
    pub secret_access_key_env: Option<String>,
    pub force_path_style: Option<bool>,
    pub verify_etag: Option<bool>,
    pub allow_overwrite: Option<bool>,
    pub keep_latest: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonFolderStoreConfig {
    pub name: Option<String>,
    pub folder_id: Option<String>,
    pub access_token_file: Option<PathBuf>,
    pub access_token_env: Option<String>,
    pub service_account_file: Option<PathBuf>,
    pub allow_overwrite: Option<bool>,
    pub keep_latest: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JsonDestinationConfig {
    ObjectStore(JsonObjectStoreConfig),
    FolderStore(JsonFolderStoreConfig),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonNotifyOptions {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonLoggingOptions {
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub cpanel: Option<JsonCpanelConfig>,
    #[serde(default)]
    pub backup: JsonBackupOptions,
    #[serde(default)]
    pub transfer: JsonTransferOptions,
    #[serde(default)]
    pub retention: JsonRetentionOptions,
    #[serde(default)]
    pub destinations: Vec<JsonDestinationConfig>,
    #[serde(default)]
    pub notify: JsonNotifyOptions,
    #[serde(default)]
    pub logging: JsonLoggingOptions,
    pub run_timeout_secs: Option<u64>,
}

/// String that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct CpanelConfig {
    pub url: Url,
    pub username: String,
    pub api_token: Secret,
    pub notify_email: Option<String>,
    pub include_homedir: bool,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub search_dir: PathBuf,
    /// Anchored full-name match.
    pub artifact_pattern: Regex,
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_interval_ceiling: Duration,
    pub locate_wait: Duration,
    pub clock_skew: Duration,
    pub compute_checksum: bool,
    pub request_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// `None` runs every destination at once.
    pub max_concurrency: Option<usize>,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_ceiling: Duration,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    ObjectStore,
    FolderStore,
}

impl DestinationKind {
    fn default_name(self) -> &'static str {
        match self {
            DestinationKind::ObjectStore => "s3",
            DestinationKind::FolderStore => "gdrive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S3Credentials {
    Static {
        access_key_id: String,
        secret_access_key: Secret,
    },
    Profile(String),
    DefaultChain,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub bucket_name: String,
    /// Empty, or ends with `/`.
    pub key_prefix: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub credentials: S3Credentials,
    pub force_path_style: bool,
    pub verify_etag: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    File(PathBuf),
    Env(String),
    /// Service account key; tokens are minted and refreshed at upload time.
    ServiceAccount(PathBuf),
}

impl TokenSource {
    /// Reads a static bearer token. Service accounts have none to read.
    pub fn resolve(&self) -> Result<Secret> {
        let token = match self {
            TokenSource::File(path) => fs::read_to_string(path)
                .with_context(|| format!("Failed to read access token file {}", path.display()))?,
            TokenSource::Env(var) => std::env::var(var)
                .with_context(|| format!("Access token environment variable {} is not set", var))?,
            TokenSource::ServiceAccount(path) => {
                anyhow::bail!("{} is a service account key, not a static token", path.display())
            }
        };
        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("Access token from {:?} is empty", self);
        }
        Ok(Secret::new(token))
    }
}

#[derive(Debug, Clone)]
pub struct FolderStoreConfig {
    pub folder_id: String,
    pub access_token: TokenSource,
}

#[derive(Debug, Clone)]
pub enum DestinationTarget {
    ObjectStore(ObjectStoreConfig),
    FolderStore(FolderStoreConfig),
}

#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub name: String,
    pub allow_overwrite: bool,
    /// Keep only the N newest backups at the destination.
    pub keep_latest: Option<usize>,
    pub target: DestinationTarget,
}

impl DestinationConfig {
    pub fn kind(&self) -> DestinationKind {
        match self.target {
            DestinationTarget::ObjectStore(_) => DestinationKind::ObjectStore,
            DestinationTarget::FolderStore(_) => DestinationKind::FolderStore,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub webhook_url: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cpanel: CpanelConfig,
    pub backup: BackupConfig,
    pub transfer: TransferConfig,
    pub retention: RetentionPolicy,
    pub destinations: Vec<DestinationConfig>,
    pub notify: NotifyConfig,
    pub log_dir: PathBuf,
    pub run_timeout: Option<Duration>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;

        Self::from_raw(raw_json_config, |name| std::env::var(name).ok())
    }

    /// Validates the raw file contents; `env` supplies secrets not present in the file.
    pub fn from_raw<F>(raw: RawJsonConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cpanel = load_cpanel_config(raw.cpanel.as_ref(), &env)?;
        let backup = load_backup_config(&raw.backup, &cpanel.username)?;
        let transfer = load_transfer_config(&raw.transfer)?;
        let destinations = load_destinations(&raw.destinations, &env)?;

        let webhook_url = raw
            .notify
            .webhook_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(Url::parse)
            .transpose()
            .context("notify.webhook_url is not a valid URL")?;

        Ok(AppConfig {
            cpanel,
            backup,
            transfer,
            retention: raw.retention.policy.unwrap_or_default(),
            destinations,
            notify: NotifyConfig { webhook_url },
            log_dir: raw
                .logging
                .directory
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            run_timeout: raw.run_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn load_cpanel_config<F>(raw: Option<&JsonCpanelConfig>, env: &F) -> Result<CpanelConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let from_file = |pick: fn(&JsonCpanelConfig) -> Option<&String>| raw.and_then(|c| non_empty(pick(c)));

    let url = from_file(|c| c.url.as_ref())
        .or_else(|| env("CPANEL_URL"))
        .context("cpanel.url must be set in config.json or CPANEL_URL")?;
    let username = from_file(|c| c.username.as_ref())
        .or_else(|| env("CPANEL_USERNAME"))
        .context("cpanel.username must be set in config.json or CPANEL_USERNAME")?;
    let api_token = from_file(|c| c.api_token.as_ref())
        .or_else(|| env("CPANEL_API_TOKEN"))
        .context("cpanel.api_token must be set in config.json or CPANEL_API_TOKEN")?;
    let notify_email = from_file(|c| c.notify_email.as_ref()).or_else(|| env("BACKUP_EMAIL"));

    let url = Url::parse(&url).with_context(|| format!("cpanel.url is not a valid URL: {}", url))?;
    if !matches!(url.scheme(), "https" | "http") {
        anyhow::bail!("cpanel.url must use http or https, got {}", url.scheme());
    }

    Ok(CpanelConfig {
        url,
        username,
        api_token: Secret::new(api_token),
        notify_email,
        include_homedir: raw.and_then(|c| c.include_homedir).unwrap_or(true),
        request_timeout: Duration::from_secs(
            raw.and_then(|c| c.request_timeout_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        ),
    })
}

/// Builds the anchored artifact regex; `{username}` expands to the escaped cPanel user.
pub fn build_artifact_pattern(pattern: &str, username: &str) -> Result<Regex> {
    let expanded = pattern.replace("{username}", &regex::escape(username));
    Regex::new(&format!("^(?:{})$", expanded))
        .with_context(|| format!("backup.artifact_pattern is not a valid regex: {}", pattern))
}

fn load_backup_config(raw: &JsonBackupOptions, username: &str) -> Result<BackupConfig> {
    let search_dir = raw
        .search_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("/home/{}", username)));
    if search_dir.to_string_lossy().is_empty() {
        return Err(anyhow::anyhow!("backup.search_dir cannot be empty in config.json."));
    }

    let artifact_pattern = build_artifact_pattern(
        raw.artifact_pattern
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_ARTIFACT_PATTERN),
        username,
    )?;

    let poll_interval = raw.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
    if poll_interval == 0 {
        anyhow::bail!("backup.poll_interval_secs must be greater than zero");
    }
    let poll_ceiling = raw
        .poll_interval_ceiling_secs
        .unwrap_or(DEFAULT_POLL_CEILING_SECS.max(poll_interval));
    if poll_ceiling < poll_interval {
        anyhow::bail!(
            "backup.poll_interval_ceiling_secs ({}) must not be below backup.poll_interval_secs ({})",
            poll_ceiling,
            poll_interval
        );
    }
    let request_attempts = raw.request_attempts.unwrap_or(1);
    if request_attempts == 0 {
        anyhow::bail!("backup.request_attempts must be at least 1");
    }

    Ok(BackupConfig {
        search_dir,
        artifact_pattern,
        poll_timeout: Duration::from_secs(raw.poll_timeout_secs.unwrap_or(DEFAULT_POLL_TIMEOUT_SECS)),
        poll_interval: Duration::from_secs(poll_interval),
        poll_interval_ceiling: Duration::from_secs(poll_ceiling),
        locate_wait: Duration::from_secs(raw.locate_wait_secs.unwrap_or(DEFAULT_LOCATE_WAIT_SECS)),
        clock_skew: Duration::from_secs(raw.clock_skew_secs.unwrap_or(DEFAULT_CLOCK_SKEW_SECS)),
        compute_checksum: raw.compute_checksum.unwrap_or(false),
        request_attempts,
    })
}

fn load_transfer_config(raw: &JsonTransferOptions) -> Result<TransferConfig> {
    if raw.max_concurrency == Some(0) {
        anyhow::bail!("transfer.max_concurrency must be at least 1 when set");
    }
    let max_attempts = raw.max_attempts.unwrap_or(DEFAULT_TRANSFER_ATTEMPTS);
    if max_attempts == 0 {
        anyhow::bail!("transfer.max_attempts must be at least 1");
    }
    let chunk_mib = raw.chunk_size_mib.unwrap_or(DEFAULT_CHUNK_MIB);
    if chunk_mib < MIN_CHUNK_MIB {
        anyhow::bail!(
            "transfer.chunk_size_mib must be at least {} (got {})",
            MIN_CHUNK_MIB,
            chunk_mib
        );
    }

    Ok(TransferConfig {
        max_concurrency: raw.max_concurrency,
        max_attempts,
        retry_base_delay: Duration::from_secs(raw.retry_base_delay_secs.unwrap_or(DEFAULT_RETRY_BASE_SECS)),
        retry_ceiling: Duration::from_secs(raw.retry_ceiling_secs.unwrap_or(DEFAULT_RETRY_CEILING_SECS)),
        chunk_size: chunk_mib * 1024 * 1024,
    })
}

/// Trims slashes and guarantees a trailing `/` so keys join cleanly.
pub fn normalize_prefix(prefix: Option<&str>) -> String {
    match prefix.map(|p| p.trim().trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{}/", p),
        _ => String::new(),
    }
}

fn load_object_store<F>(raw: &JsonObjectStoreConfig, env: &F) -> Result<ObjectStoreConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let bucket_name = non_empty(raw.bucket_name.as_ref())
        .context("bucket_name must be set for object_store destinations")?;

    let access_key_id = non_empty(raw.access_key_id.as_ref())
        .or_else(|| raw.access_key_id_env.as_deref().and_then(env));
    let secret_access_key = non_empty(raw.secret_access_key.as_ref())
        .or_else(|| raw.secret_access_key_env.as_deref().and_then(env));

    let credentials = match (access_key_id, secret_access_key, non_empty(raw.profile.as_ref())) {
        (Some(access_key_id), Some(secret), _) => S3Credentials::Static {
            access_key_id,
            secret_access_key: Secret::new(secret),
        },
        (Some(_), None, _) | (None, Some(_), _) => {
            anyhow::bail!(
                "object_store destination for bucket {} has only one of access_key_id / secret_access_key",
                bucket_name
            )
        }
        (None, None, Some(profile)) => S3Credentials::Profile(profile),
        (None, None, None) => S3Credentials::DefaultChain,
    };

    Ok(ObjectStoreConfig {
        bucket_name,
        key_prefix: normalize_prefix(raw.folder_prefix.as_deref()),
        region: non_empty(raw.region.as_ref()),
        endpoint_url: non_empty(raw.endpoint_url.as_ref()),
        credentials,
        force_path_style: raw.force_path_style.unwrap_or(false),
        verify_etag: raw.verify_etag.unwrap_or(true),
    })
}

fn load_folder_store(raw: &JsonFolderStoreConfig) -> Result<FolderStoreConfig> {
    let folder_id = non_empty(raw.folder_id.as_ref())
        .context("folder_id must be set for folder_store destinations")?;
    let access_token = match (
        &raw.service_account_file,
        &raw.access_token_file,
        non_empty(raw.access_token_env.as_ref()),
    ) {
        (Some(path), None, None) => TokenSource::ServiceAccount(path.clone()),
        (Some(_), _, _) => anyhow::bail!(
            "folder_store destination {} sets service_account_file together with a static access token",
            folder_id
        ),
        (None, Some(path), _) => TokenSource::File(path.clone()),
        (None, None, Some(var)) => TokenSource::Env(var),
        (None, None, None) => anyhow::bail!(
            "folder_store destination {} needs service_account_file, access_token_file or access_token_env",
            folder_id
        ),
    };
    Ok(FolderStoreConfig {
        folder_id,
        access_token,
    })
}

fn load_destinations<F>(raw: &[JsonDestinationConfig], env: &F) -> Result<Vec<DestinationConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    if raw.is_empty() {
        anyhow::bail!("At least one entry in destinations must be configured");
    }

    let mut seen = HashSet::new();
    let mut destinations = Vec::with_capacity(raw.len());
    for (index, entry) in raw.iter().enumerate() {
        let (name, allow_overwrite, keep_latest, target) = match entry {
            JsonDestinationConfig::ObjectStore(s3) => (
                s3.name.clone(),
                s3.allow_overwrite,
                s3.keep_latest,
                DestinationTarget::ObjectStore(
                    load_object_store(s3, env)
                        .with_context(|| format!("Invalid destinations[{}]", index))?,
                ),
            ),
            JsonDestinationConfig::FolderStore(drive) => (
                drive.name.clone(),
                drive.allow_overwrite,
                drive.keep_latest,
                DestinationTarget::FolderStore(
                    load_folder_store(drive).with_context(|| format!("Invalid destinations[{}]", index))?,
                ),
            ),
        };

        let kind = match target {
            DestinationTarget::ObjectStore(_) => DestinationKind::ObjectStore,
            DestinationTarget::FolderStore(_) => DestinationKind::FolderStore,
        };
        let name = non_empty(name.as_ref()).unwrap_or_else(|| {
            if raw.len() == 1 {
                kind.default_name().to_string()
            } else {
                format!("{}-{}", kind.default_name(), index + 1)
            }
        });
        if !seen.insert(name.clone()) {
            anyhow::bail!("Destination name '{}' is used more than once", name);
        }
        if keep_latest == Some(0) {
            anyhow::bail!("destinations[{}].keep_latest must be at least 1 when set", index);
        }

        destinations.push(DestinationConfig {
            name,
            allow_overwrite: allow_overwrite.unwrap_or(false),
            keep_latest,
            target,
        });
    }
    Ok(destinations)
}
