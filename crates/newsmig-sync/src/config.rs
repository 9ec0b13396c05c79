use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use newsmig_core::DEFAULT_AUDIT_USER_ID;
use newsmig_storage::{BackoffPolicy, HttpClientConfig, S3Config, UploaderConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BATCH_SIZE: usize = 25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Local { root: PathBuf },
    Http { base_url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    S3(S3Config),
    Local { root: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    pub database_url: String,
    pub max_db_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub batch_size: usize,
    pub row_limit: Option<u64>,
    pub legacy_domain: String,
    pub audit_user_id: i64,
    pub source: SourceConfig,
    pub storage: StorageConfig,
    pub upload_timeout_secs: u64,
    pub upload_concurrency: usize,
    pub upload_max_retries: usize,
    pub skip_existing_objects: bool,
    pub user_agent: String,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_db_connections: 4,
            db_acquire_timeout_secs: 10,
            batch_size: DEFAULT_BATCH_SIZE,
            row_limit: None,
            legacy_domain: String::new(),
            audit_user_id: DEFAULT_AUDIT_USER_ID,
            source: SourceConfig::Local {
                root: PathBuf::from("./legacy"),
            },
            storage: StorageConfig::Local {
                root: PathBuf::from("./media"),
            },
            upload_timeout_secs: 20,
            upload_concurrency: 4,
            upload_max_retries: 2,
            skip_existing_objects: false,
            user_agent: "newsmig-bot/0.1".to_string(),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl MigratorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Environment-style overrides on top of the defaults; unparsable numbers keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let source = match (lookup("NEWSMIG_SOURCE_URL"), lookup("NEWSMIG_SOURCE_DIR")) {
            (Some(base_url), _) => SourceConfig::Http { base_url },
            (None, Some(root)) => SourceConfig::Local {
                root: PathBuf::from(root),
            },
            (None, None) => defaults.source,
        };
        let storage = match lookup("NEWSMIG_S3_BUCKET") {
            Some(bucket) => StorageConfig::S3(S3Config {
                bucket,
                region: lookup("AWS_REGION")
                    .or_else(|| lookup("AWS_DEFAULT_REGION"))
                    .unwrap_or_else(|| "us-east-1".to_string()),
                endpoint_url: lookup("NEWSMIG_S3_ENDPOINT"),
            }),
            None => lookup("NEWSMIG_OUTPUT_DIR")
                .map(|root| StorageConfig::Local {
                    root: PathBuf::from(root),
                })
                .unwrap_or(defaults.storage),
        };

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            max_db_connections: parse_var(&lookup, "NEWSMIG_DB_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_db_connections),
            db_acquire_timeout_secs: parse_var(&lookup, "NEWSMIG_DB_ACQUIRE_TIMEOUT_SECS")
                .unwrap_or(defaults.db_acquire_timeout_secs),
            batch_size: parse_var(&lookup, "NEWSMIG_BATCH_SIZE").unwrap_or(defaults.batch_size),
            row_limit: parse_var(&lookup, "NEWSMIG_ROW_LIMIT"),
            legacy_domain: lookup("NEWSMIG_LEGACY_DOMAIN").unwrap_or(defaults.legacy_domain),
            audit_user_id: parse_var(&lookup, "NEWSMIG_AUDIT_USER_ID")
                .unwrap_or(defaults.audit_user_id),
            source,
            storage,
            upload_timeout_secs: parse_var(&lookup, "NEWSMIG_UPLOAD_TIMEOUT_SECS")
                .unwrap_or(defaults.upload_timeout_secs),
            upload_concurrency: parse_var(&lookup, "NEWSMIG_UPLOAD_CONCURRENCY")
                .unwrap_or(defaults.upload_concurrency),
            upload_max_retries: parse_var(&lookup, "NEWSMIG_UPLOAD_MAX_RETRIES")
                .unwrap_or(defaults.upload_max_retries),
            skip_existing_objects: lookup("NEWSMIG_SKIP_EXISTING")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.skip_existing_objects),
            user_agent: lookup("NEWSMIG_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.upload_concurrency == 0 {
            bail!("upload_concurrency must be at least 1");
        }
        if self.database_url.trim().is_empty() {
            bail!("database_url is empty; set DATABASE_URL");
        }
        if let StorageConfig::S3(s3) = &self.storage {
            if s3.bucket.trim().is_empty() {
                bail!("s3 bucket name is empty");
            }
            if s3.region.trim().is_empty() {
                bail!("s3 region is empty");
            }
        }
        if let SourceConfig::Http { base_url } = &self.source {
            if base_url.trim().is_empty() {
                bail!("source base_url is empty");
            }
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.upload_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn uploader_config(&self) -> UploaderConfig {
        UploaderConfig {
            timeout: Duration::from_secs(self.upload_timeout_secs.max(1)),
            max_concurrent_uploads: self.upload_concurrency,
            backoff: BackoffPolicy {
                max_retries: self.upload_max_retries,
                ..Default::default()
            },
            skip_existing: self.skip_existing_objects,
        }
    }
}
