use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::AiService;
use crate::error::LLMError;
use crate::http::DynHttpTransport;
use crate::http::reqwest::default_dyn_transport;
use crate::provider::ProviderKind;

/// 服务配置 描述一个可调用后端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub provider: ProviderKind,
    pub token: String,
    /// 留空时按 provider 默认
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// OpenAI-Organization header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    pub read_timeout_secs: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            token: String::new(),
            base_url: None,
            organization: None,
            read_timeout_secs: 10,
            heartbeat_interval_ms: 5_000,
        }
    }
}

impl ServiceConfig {
    /// 检查配置 不发起任何请求
    pub fn validate(&self) -> Result<(), LLMError> {
        if self.token.trim().is_empty() {
            return Err(LLMError::configuration("token", "must not be empty"));
        }
        if self.read_timeout_secs == 0 {
            return Err(LLMError::configuration(
                "read_timeout_secs",
                "must be greater than zero",
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(LLMError::configuration(
                "heartbeat_interval_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// 根据配置构建 AiService 未提供 transport 时使用默认 reqwest 实现
pub fn build_service(
    config: &ServiceConfig,
    transport: Option<DynHttpTransport>,
) -> Result<AiService, LLMError> {
    config.validate()?;
    let transport = match transport {
        Some(transport) => transport,
        None => default_dyn_transport(config.read_timeout())?,
    };

    let mut builder = AiService::builder()
        .provider(config.provider)
        .token(config.token.clone())
        .heartbeat_interval(config.heartbeat_interval())
        .transport(transport);
    if let Some(base_url) = &config.base_url {
        builder = builder.base_url(base_url.clone());
    }
    if let Some(organization) = &config.organization {
        builder = builder.organization(organization.clone());
    }
    builder.build()
}
