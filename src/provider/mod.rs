use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LLMError, ProviderErrorPayload};

pub mod google;
pub mod openai;

/// 支持的后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProviderKind {
    /// OpenAI 兼容接口 主后端
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// Google Generative Language API 次后端
    #[serde(rename = "google")]
    Google,
}

impl ProviderKind {
    /// 供应商名称 用于日志与错误
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Google => "google",
        }
    }

    /// 未配置 base_url 时使用的地址
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => openai::DEFAULT_BASE_URL,
            Self::Google => google::DEFAULT_BASE_URL,
        }
    }

    /// 鉴权 header
    pub fn auth_headers(self, token: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        match self {
            Self::OpenAi => {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            Self::Google => {
                headers.insert("x-goog-api-key".to_string(), token.to_string());
            }
        }
        headers
    }

    /// Parses an error body under this backend's error schema.
    pub fn parse_error_payload(self, body: &str) -> Option<ProviderErrorPayload> {
        match self {
            Self::OpenAi => openai::parse_error(body).map(ProviderErrorPayload::OpenAi),
            Self::Google => google::parse_error(body).map(ProviderErrorPayload::Google),
        }
    }

    /// Maps a non-2xx response onto the error taxonomy.
    ///
    /// A body matching the error schema gives [`LLMError::ProviderHttp`]; anything
    /// else, including no body at all, gives [`LLMError::UnparseableHttp`] with the
    /// body kept verbatim.
    pub fn http_error(
        self,
        status: u16,
        headers: &HashMap<String, String>,
        body: Option<String>,
    ) -> LLMError {
        let payload = body
            .as_deref()
            .and_then(|text| self.parse_error_payload(text));
        match payload {
            Some(error) => LLMError::ProviderHttp {
                provider: self.name(),
                status,
                error,
                retry_after: retry_after_from_headers(headers),
            },
            None => LLMError::UnparseableHttp {
                provider: self.name(),
                status,
                body,
            },
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reads a numeric `Retry-After` header. HTTP-date values are ignored.
pub(crate) fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Validates and normalizes a base URL.
///
/// An empty value falls back to the backend default. The scheme must be `http` or
/// `https`; trailing slashes are removed.
///
/// # Examples
///
/// ```
/// use genai_service::provider::{ProviderKind, normalize_base_url};
///
/// assert_eq!(
///     normalize_base_url("https://proxy.example.com/", ProviderKind::OpenAi).unwrap(),
///     "https://proxy.example.com"
/// );
/// assert_eq!(
///     normalize_base_url("  ", ProviderKind::Google).unwrap(),
///     "https://generativelanguage.googleapis.com"
/// );
/// assert!(normalize_base_url("ftp://example.com", ProviderKind::OpenAi).is_err());
/// ```
pub fn normalize_base_url(url: &str, provider: ProviderKind) -> Result<String, LLMError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Ok(provider.default_base_url().to_string());
    }
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .ok_or_else(|| {
            LLMError::configuration("base_url", format!("{trimmed} is not an http(s) URL"))
        })?;
    if rest.trim_matches('/').is_empty() {
        return Err(LLMError::configuration(
            "base_url",
            format!("{trimmed} has no host"),
        ));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

/// Credential and server selection shared by every call of a service.
///
/// The token and the base URL each record the backend they belong to. They must
/// agree before a request is built; a mismatch is reported by [`resolve`] as a
/// configuration error and never guessed away.
///
/// [`resolve`]: ProviderContext::resolve
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderContext {
    token: String,
    token_provider: ProviderKind,
    base_url: String,
    url_provider: ProviderKind,
}

impl ProviderContext {
    /// 创建 token 与 base_url 属于同一后端的上下文
    pub fn new(
        provider: ProviderKind,
        token: impl Into<String>,
        base_url: Option<&str>,
    ) -> Result<Self, LLMError> {
        let base_url = normalize_base_url(base_url.unwrap_or_default(), provider)?;
        Ok(Self {
            token: token.into(),
            token_provider: provider,
            base_url,
            url_provider: provider,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token_provider(&self) -> ProviderKind {
        self.token_provider
    }

    pub fn url_provider(&self) -> ProviderKind {
        self.url_provider
    }

    /// Returns the backend both halves agree on.
    ///
    /// # Errors
    ///
    /// [`LLMError::Configuration`] when the token and the URL belong to different
    /// backends.
    pub fn resolve(&self) -> Result<ProviderKind, LLMError> {
        if self.token_provider == self.url_provider {
            return Ok(self.token_provider);
        }
        warn!(
            token_provider = self.token_provider.name(),
            url_provider = self.url_provider.name(),
            "token and base url belong to different providers"
        );
        Err(LLMError::configuration(
            "provider",
            format!(
                "token belongs to {} but base url belongs to {}",
                self.token_provider, self.url_provider
            ),
        ))
    }

    /// Like [`resolve`](Self::resolve), and additionally requires `expected`.
    pub fn require(&self, expected: ProviderKind) -> Result<ProviderKind, LLMError> {
        let provider = self.resolve()?;
        if provider != expected {
            return Err(LLMError::configuration(
                "provider",
                format!("operation requires {expected} but the service is configured for {provider}"),
            ));
        }
        Ok(provider)
    }

    /// 替换 token
    pub fn set_token(&mut self, token: impl Into<String>, provider: ProviderKind) {
        self.token = token.into();
        self.token_provider = provider;
    }

    /// 替换 base_url
    pub fn set_base_url(&mut self, url: &str, provider: ProviderKind) -> Result<(), LLMError> {
        self.base_url = normalize_base_url(url, provider)?;
        self.url_provider = provider;
        Ok(())
    }

    /// 同时替换 token 与 base_url 失败时保持原状
    pub fn set_credentials(
        &mut self,
        token: impl Into<String>,
        url: &str,
        provider: ProviderKind,
    ) -> Result<(), LLMError> {
        let base_url = normalize_base_url(url, provider)?;
        self.token = token.into();
        self.token_provider = provider;
        self.base_url = base_url;
        self.url_provider = provider;
        Ok(())
    }

    /// Replaces the token. When the current URL belongs to another backend it is
    /// replaced by `fallback_url` too, so the context stays consistent.
    pub fn switch_token(
        &mut self,
        token: impl Into<String>,
        provider: ProviderKind,
        fallback_url: &str,
    ) -> Result<(), LLMError> {
        if self.url_provider == provider {
            self.set_token(token, provider);
            Ok(())
        } else {
            self.set_credentials(token, fallback_url, provider)
        }
    }

    /// Replaces the URL. When the current token belongs to another backend it is
    /// replaced by `fallback_token` too.
    pub fn switch_server(
        &mut self,
        url: &str,
        provider: ProviderKind,
        fallback_token: impl Into<String>,
    ) -> Result<(), LLMError> {
        if self.token_provider == provider {
            self.set_base_url(url, provider)
        } else {
            self.set_credentials(fallback_token, url, provider)
        }
    }

    /// Moves the context to `provider`, replacing only the halves that belong to
    /// another backend.
    pub fn switch_to(
        &mut self,
        provider: ProviderKind,
        token: impl Into<String>,
        url: &str,
    ) -> Result<(), LLMError> {
        if self.url_provider != provider {
            self.set_base_url(url, provider)?;
        }
        if self.token_provider != provider {
            self.set_token(token, provider);
        }
        Ok(())
    }
}

impl fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderContext")
            .field("token", &"<redacted>")
            .field("token_provider", &self.token_provider)
            .field("base_url", &self.base_url)
            .field("url_provider", &self.url_provider)
            .finish()
    }
}
