//! Configuration module for reconciliation-workflow.

use crate::services::WorkflowSettings;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub paging: PagingConfig,
    pub idempotency: IdempotencyConfig,
    pub suggestion_engine: RemoteServiceConfig,
    pub entity_service: RemoteServiceConfig,
}

#[derive(Debug, Clone)]
pub struct PagingConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub retention_secs: u64,
}

/// An empty URL means the in-process implementation is used.
#[derive(Debug, Clone, Default)]
pub struct RemoteServiceConfig {
    pub url: Option<String>,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", name, raw))
        }),
        _ => Ok(default),
    }
}

fn optional_url(name: &str) -> RemoteServiceConfig {
    RemoteServiceConfig {
        url: env::var(name).ok().filter(|url| !url.trim().is_empty()),
    }
}

impl WorkflowConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let config = Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "reconciliation-workflow".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|e| !e.is_empty()),
            paging: PagingConfig {
                default_page_size: parse_var("DEFAULT_PAGE_SIZE", 50)?,
                max_page_size: parse_var("MAX_PAGE_SIZE", 200)?,
            },
            idempotency: IdempotencyConfig {
                retention_secs: parse_var("IDEMPOTENCY_RETENTION_SECS", 600)?,
            },
            suggestion_engine: optional_url("SUGGESTION_ENGINE_URL"),
            entity_service: optional_url("ENTITY_SERVICE_URL"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        let paging = &self.paging;
        if paging.default_page_size == 0 || paging.default_page_size > paging.max_page_size {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DEFAULT_PAGE_SIZE must be between 1 and MAX_PAGE_SIZE ({})",
                paging.max_page_size
            )));
        }
        Ok(())
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            default_page_size: self.paging.default_page_size,
            max_page_size: self.paging.max_page_size,
            idempotency_retention: Duration::from_secs(self.idempotency.retention_secs),
            ..WorkflowSettings::default()
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            service_name: "reconciliation-workflow".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            paging: PagingConfig {
                default_page_size: 50,
                max_page_size: 200,
            },
            idempotency: IdempotencyConfig { retention_secs: 600 },
            suggestion_engine: RemoteServiceConfig::default(),
            entity_service: RemoteServiceConfig::default(),
        }
    }
}
