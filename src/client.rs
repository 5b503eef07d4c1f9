use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::error::LLMError;
use crate::http::reqwest::{DEFAULT_READ_TIMEOUT, default_dyn_transport};
use crate::http::{DynHttpTransport, HttpRequest, HttpResponse, is_success};
use crate::lifecycle::{
    CallId, CallRegistry, CallSink, Coordinator, DEFAULT_HEARTBEAT_INTERVAL,
};
use crate::provider::google::{self, GenerateContentRequest, GenerateContentResponse};
use crate::provider::openai::{
    self, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResult, CompletionChunk,
    CompletionRequest, CompletionResult, CreateImageRequest, DeleteResult, EditRequest,
    EditResult, EmbeddingRequest, EmbeddingResult, FileObject, FineTuneEvent, FineTuneRequest,
    FineTuneResult, ImageResult, ListResponse, Model, ModerationRequest, ModerationResult,
};
use crate::provider::{ProviderContext, ProviderKind};
use crate::stream::{self, ChunkStream, SseFrame, StreamOptions, json_decoder, raw_frames};

const EVENT_STREAM: &str = "text/event-stream";

/// 统一调用入口 覆盖 OpenAI 兼容接口与 Google Generative Language API
///
/// Every operation first checks that the token and the base URL belong to the
/// backend it targets; otherwise it fails with [`LLMError::Configuration`] and
/// nothing is sent.
///
/// The `*_with` operations report through a [`CallSink`] and share one
/// [`Coordinator`], so starting one cancels the unfinished previous one. Streams
/// and callback calls are listed in the service's [`CallRegistry`] until they end.
pub struct AiService {
    transport: DynHttpTransport,
    context: RwLock<ProviderContext>,
    organization: Option<String>,
    registry: CallRegistry,
    coordinator: Coordinator,
}

struct Target {
    provider: ProviderKind,
    base_url: String,
    headers: HashMap<String, String>,
}

impl AiService {
    /// 创建 Builder
    pub fn builder() -> AiServiceBuilder {
        AiServiceBuilder::default()
    }

    fn read_context(&self) -> RwLockReadGuard<'_, ProviderContext> {
        self.context
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_context(&self) -> RwLockWriteGuard<'_, ProviderContext> {
        self.context
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 当前上下文快照
    pub fn context(&self) -> ProviderContext {
        self.read_context().clone()
    }

    /// 当前生效的后端 token 与 base_url 不一致时返回错误
    pub fn provider(&self) -> Result<ProviderKind, LLMError> {
        self.read_context().resolve()
    }

    pub fn set_token(&self, token: impl Into<String>, provider: ProviderKind) {
        self.write_context().set_token(token, provider);
    }

    pub fn set_base_url(&self, url: &str, provider: ProviderKind) -> Result<(), LLMError> {
        self.write_context().set_base_url(url, provider)
    }

    pub fn set_credentials(
        &self,
        token: impl Into<String>,
        url: &str,
        provider: ProviderKind,
    ) -> Result<(), LLMError> {
        self.write_context().set_credentials(token, url, provider)
    }

    /// See [`ProviderContext::switch_token`].
    pub fn switch_token(
        &self,
        token: impl Into<String>,
        provider: ProviderKind,
        fallback_url: &str,
    ) -> Result<(), LLMError> {
        self.write_context()
            .switch_token(token, provider, fallback_url)
    }

    /// See [`ProviderContext::switch_server`].
    pub fn switch_server(
        &self,
        url: &str,
        provider: ProviderKind,
        fallback_token: impl Into<String>,
    ) -> Result<(), LLMError> {
        self.write_context()
            .switch_server(url, provider, fallback_token)
    }

    /// See [`ProviderContext::switch_to`].
    pub fn switch_to(
        &self,
        provider: ProviderKind,
        token: impl Into<String>,
        url: &str,
    ) -> Result<(), LLMError> {
        self.write_context().switch_to(provider, token, url)
    }

    /// 取消当前回调调用
    pub fn cancel(&self) -> bool {
        self.coordinator.cancel()
    }

    /// Force-cancels every stream and callback call of this service, e.g. on shutdown.
    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all()
    }

    /// 进行中的调用
    pub fn in_flight(&self) -> Vec<(CallId, &'static str)> {
        self.registry.in_flight()
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    fn target(&self, expected: ProviderKind) -> Result<Target, LLMError> {
        let context = self.read_context();
        let provider = context.require(expected)?;
        Ok(self.target_for(&context, provider))
    }

    fn target_for(&self, context: &ProviderContext, provider: ProviderKind) -> Target {
        let mut headers = provider.auth_headers(context.token());
        if provider == ProviderKind::OpenAi {
            if let Some(organization) = &self.organization {
                headers.insert("OpenAI-Organization".to_string(), organization.clone());
            }
        }
        Target {
            provider,
            base_url: context.base_url().to_string(),
            headers,
        }
    }

    fn openai_get(&self, path: &str) -> Result<HttpRequest, LLMError> {
        let target = self.target(ProviderKind::OpenAi)?;
        Ok(HttpRequest::get(openai::endpoint(&target.base_url, path)).with_headers(target.headers))
    }

    fn openai_delete(&self, path: &str) -> Result<HttpRequest, LLMError> {
        let target = self.target(ProviderKind::OpenAi)?;
        Ok(HttpRequest::delete(openai::endpoint(&target.base_url, path))
            .with_headers(target.headers))
    }

    fn openai_post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<HttpRequest, LLMError> {
        let target = self.target(ProviderKind::OpenAi)?;
        Ok(
            HttpRequest::json(openai::endpoint(&target.base_url, path), body)?
                .with_headers(target.headers),
        )
    }

    fn google_post(
        &self,
        model: &str,
        body: &GenerateContentRequest,
        stream: bool,
    ) -> Result<HttpRequest, LLMError> {
        if model.trim().is_empty() {
            return Err(LLMError::Validation {
                message: "model is required for Google generateContent".to_string(),
            });
        }
        let target = self.target(ProviderKind::Google)?;
        let url = if stream {
            google::stream_endpoint(&target.base_url, model)
        } else {
            google::generate_endpoint(&target.base_url, model)
        };
        Ok(HttpRequest::json(url, body)?.with_headers(target.headers))
    }

    async fn send<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T, LLMError> {
        execute(&self.transport, request, ProviderKind::OpenAi).await
    }

    /// 列出可用模型
    pub async fn list_models(&self) -> Result<Vec<Model>, LLMError> {
        let list: ListResponse<Model> = self.send(self.openai_get("models")?).await?;
        Ok(list.data)
    }

    pub async fn get_model(&self, model_id: &str) -> Result<Model, LLMError> {
        self.send(self.openai_get(&format!("models/{model_id}"))?)
            .await
    }

    /// 文本补全
    pub async fn create_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResult, LLMError> {
        self.send(self.openai_post("completions", request)?).await
    }

    /// 发送同步聊天请求
    pub async fn create_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResult, LLMError> {
        self.send(self.openai_post("chat/completions", request)?)
            .await
    }

    pub async fn create_edit(&self, request: &EditRequest) -> Result<EditResult, LLMError> {
        self.send(self.openai_post("edits", request)?).await
    }

    pub async fn create_embeddings(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResult, LLMError> {
        self.send(self.openai_post("embeddings", request)?).await
    }

    pub async fn list_files(&self) -> Result<Vec<FileObject>, LLMError> {
        let list: ListResponse<FileObject> = self.send(self.openai_get("files")?).await?;
        Ok(list.data)
    }

    pub async fn retrieve_file(&self, file_id: &str) -> Result<FileObject, LLMError> {
        self.send(self.openai_get(&format!("files/{file_id}"))?)
            .await
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<DeleteResult, LLMError> {
        self.send(self.openai_delete(&format!("files/{file_id}"))?)
            .await
    }

    pub async fn create_fine_tune(
        &self,
        request: &FineTuneRequest,
    ) -> Result<FineTuneResult, LLMError> {
        self.send(self.openai_post("fine-tunes", request)?).await
    }

    /// 使用微调模型补全 `request.model` 填写微调后的模型名
    pub async fn create_fine_tune_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResult, LLMError> {
        self.create_completion(request).await
    }

    pub async fn list_fine_tunes(&self) -> Result<Vec<FineTuneResult>, LLMError> {
        let list: ListResponse<FineTuneResult> = self.send(self.openai_get("fine-tunes")?).await?;
        Ok(list.data)
    }

    pub async fn retrieve_fine_tune(&self, fine_tune_id: &str) -> Result<FineTuneResult, LLMError> {
        self.send(self.openai_get(&format!("fine-tunes/{fine_tune_id}"))?)
            .await
    }

    pub async fn cancel_fine_tune(&self, fine_tune_id: &str) -> Result<FineTuneResult, LLMError> {
        let path = format!("fine-tunes/{fine_tune_id}/cancel");
        self.send(self.openai_post(&path, &serde_json::json!({}))?)
            .await
    }

    pub async fn list_fine_tune_events(
        &self,
        fine_tune_id: &str,
    ) -> Result<Vec<FineTuneEvent>, LLMError> {
        let path = format!("fine-tunes/{fine_tune_id}/events");
        let list: ListResponse<FineTuneEvent> = self.send(self.openai_get(&path)?).await?;
        Ok(list.data)
    }

    /// 删除微调产出的模型
    pub async fn delete_fine_tune(&self, model_id: &str) -> Result<DeleteResult, LLMError> {
        self.send(self.openai_delete(&format!("models/{model_id}"))?)
            .await
    }

    pub async fn create_image(&self, request: &CreateImageRequest) -> Result<ImageResult, LLMError> {
        self.send(self.openai_post("images/generations", request)?)
            .await
    }

    pub async fn create_moderation(
        &self,
        request: &ModerationRequest,
    ) -> Result<ModerationResult, LLMError> {
        self.send(self.openai_post("moderations", request)?).await
    }

    /// Google generateContent
    pub async fn generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, LLMError> {
        let request = self.google_post(model, request, false)?;
        execute(&self.transport, request, ProviderKind::Google).await
    }

    fn completion_stream(
        &self,
        mut request: CompletionRequest,
    ) -> Result<ChunkStream<CompletionChunk>, LLMError> {
        request.stream = Some(true);
        let request = self
            .openai_post("completions", &request)?
            .with_header("Accept", EVENT_STREAM);
        self.open(request, ProviderKind::OpenAi)
    }

    fn chat_stream(
        &self,
        mut request: ChatCompletionRequest,
    ) -> Result<ChunkStream<ChatCompletionChunk>, LLMError> {
        request.stream = Some(true);
        let request = self
            .openai_post("chat/completions", &request)?
            .with_header("Accept", EVENT_STREAM);
        self.open(request, ProviderKind::OpenAi)
    }

    fn generate_stream(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<ChunkStream<GenerateContentResponse>, LLMError> {
        let request = self
            .google_post(model, request, true)?
            .with_header("Accept", EVENT_STREAM);
        self.open(request, ProviderKind::Google)
    }

    fn open<T>(
        &self,
        request: HttpRequest,
        provider: ProviderKind,
    ) -> Result<ChunkStream<T>, LLMError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let runtime = self.coordinator.runtime()?;
        let _entered = runtime.enter();
        Ok(stream::open(
            self.transport.clone(),
            request,
            provider,
            StreamOptions::default(),
            json_decoder::<T>(provider.name()),
        ))
    }

    /// 流式文本补全
    ///
    /// The call runs on the service's runtime; `request.stream` is forced to `true`.
    pub fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<ChunkStream<CompletionChunk>, LLMError> {
        Ok(self
            .completion_stream(request)?
            .register(&self.registry, "stream_completion"))
    }

    /// 发起流式聊天请求
    ///
    /// The call runs on the service's runtime; `request.stream` is forced to `true`.
    pub fn stream_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChunkStream<ChatCompletionChunk>, LLMError> {
        Ok(self
            .chat_stream(request)?
            .register(&self.registry, "stream_chat_completion"))
    }

    /// Google streamGenerateContent
    pub fn stream_generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<ChunkStream<GenerateContentResponse>, LLMError> {
        Ok(self
            .generate_stream(model, request)?
            .register(&self.registry, "stream_generate_content"))
    }

    /// Streams raw SSE frames from `route` on the active backend.
    ///
    /// `route` is joined like the built-in routes (`chat/completions` becomes
    /// `{base}/v1/chat/completions` for OpenAI, `{base}/{route}` for Google). With
    /// `emit_done` the `[DONE]` sentinel is delivered as the last frame.
    pub fn stream_frames<B: Serialize + ?Sized>(
        &self,
        route: &str,
        body: &B,
        emit_done: bool,
    ) -> Result<ChunkStream<SseFrame>, LLMError> {
        let target = {
            let context = self.read_context();
            let provider = context.resolve()?;
            self.target_for(&context, provider)
        };
        let url = match target.provider {
            ProviderKind::OpenAi => openai::endpoint(&target.base_url, route),
            ProviderKind::Google => format!("{}/{}", target.base_url, route.trim_start_matches('/')),
        };
        let request = HttpRequest::json(url, body)?
            .with_headers(target.headers)
            .with_header("Accept", EVENT_STREAM);
        let runtime = self.coordinator.runtime()?;
        let _entered = runtime.enter();
        Ok(stream::open(
            self.transport.clone(),
            request,
            target.provider,
            StreamOptions { emit_done },
            raw_frames(),
        )
        .register(&self.registry, "stream_frames"))
    }

    /// 回调方式列出模型 只回调结果或错误
    pub fn list_models_with<S>(&self, sink: S) -> CallId
    where
        S: CallSink<Vec<Model>> + 'static,
    {
        let prepared = self.openai_get("models");
        let transport = self.transport.clone();
        self.coordinator.run_plain(
            "list_models",
            async move {
                let list: ListResponse<Model> =
                    execute(&transport, prepared?, ProviderKind::OpenAi).await?;
                Ok::<_, LLMError>(list.data)
            },
            sink,
        )
    }

    /// 回调方式聊天 附带 loading 状态
    pub fn chat_completion_with<S>(&self, request: &ChatCompletionRequest, sink: S) -> CallId
    where
        S: CallSink<ChatCompletionResult> + 'static,
    {
        let prepared = self.openai_post("chat/completions", request);
        let transport = self.transport.clone();
        self.coordinator.run_single(
            "create_chat_completion",
            async move {
                execute::<ChatCompletionResult>(&transport, prepared?, ProviderKind::OpenAi).await
            },
            sink,
        )
    }

    /// 回调方式调用 Google generateContent
    pub fn generate_content_with<S>(
        &self,
        model: &str,
        request: &GenerateContentRequest,
        sink: S,
    ) -> CallId
    where
        S: CallSink<GenerateContentResponse> + 'static,
    {
        let prepared = self.google_post(model, request, false);
        let transport = self.transport.clone();
        self.coordinator.run_single(
            "generate_content",
            async move {
                execute::<GenerateContentResponse>(&transport, prepared?, ProviderKind::Google).await
            },
            sink,
        )
    }

    /// 回调方式流式补全
    pub fn stream_completion_with<S>(&self, request: CompletionRequest, sink: S) -> CallId
    where
        S: CallSink<CompletionChunk> + 'static,
    {
        self.coordinator
            .run_stream("stream_completion", || self.completion_stream(request), sink)
    }

    /// 回调方式流式聊天
    ///
    /// Delivers `Loading(true)` until the first chunk, then every chunk, then
    /// `Completed` once: on a chunk with a finish reason, at the end of the body,
    /// or when the call is cancelled.
    pub fn stream_chat_completion_with<S>(&self, request: ChatCompletionRequest, sink: S) -> CallId
    where
        S: CallSink<ChatCompletionChunk> + 'static,
    {
        self.coordinator
            .run_stream("stream_chat_completion", || self.chat_stream(request), sink)
    }

    /// 回调方式调用 Google streamGenerateContent
    pub fn stream_generate_content_with<S>(
        &self,
        model: &str,
        request: &GenerateContentRequest,
        sink: S,
    ) -> CallId
    where
        S: CallSink<GenerateContentResponse> + 'static,
    {
        self.coordinator.run_stream(
            "stream_generate_content",
            || self.generate_stream(model, request),
            sink,
        )
    }
}

impl std::fmt::Debug for AiService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiService")
            .field("context", &*self.read_context())
            .field("organization", &self.organization)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

/// Sends one request and decodes a 2xx body as `T`.
///
/// Non-2xx responses become [`LLMError::ProviderHttp`] or
/// [`LLMError::UnparseableHttp`]; a 2xx body that does not fit `T` becomes
/// [`LLMError::Decode`]. Nothing is retried.
pub(crate) async fn execute<T: DeserializeOwned>(
    transport: &DynHttpTransport,
    request: HttpRequest,
    provider: ProviderKind,
) -> Result<T, LLMError> {
    trace!(provider = provider.name(), url = %request.url, "executing request");
    let HttpResponse {
        status,
        headers,
        body,
    } = transport.send(request).await?;

    if !is_success(status) {
        debug!(provider = provider.name(), status, "request returned error status");
        let text = String::from_utf8_lossy(&body).into_owned();
        let body = (!text.trim().is_empty()).then_some(text);
        return Err(provider.http_error(status, &headers, body));
    }

    let text = String::from_utf8(body).map_err(|err| {
        LLMError::decode(
            provider.name(),
            String::from_utf8_lossy(err.as_bytes()).into_owned(),
            err.utf8_error(),
        )
    })?;
    serde_json::from_str(&text).map_err(|err| LLMError::decode(provider.name(), text.clone(), err))
}

/// 构建 AiService 的 Builder
pub struct AiServiceBuilder {
    provider: ProviderKind,
    token: String,
    base_url: Option<String>,
    organization: Option<String>,
    read_timeout: Duration,
    heartbeat_interval: Duration,
    transport: Option<DynHttpTransport>,
    runtime: Option<Handle>,
}

impl Default for AiServiceBuilder {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            token: String::new(),
            base_url: None,
            organization: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            transport: None,
            runtime: None,
        }
    }
}

impl AiServiceBuilder {
    /// 选择后端 token 与 base_url 都归属于该后端
    pub fn provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// 自定义 base_url 留空时使用后端默认地址
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// 配置组织 ID 仅 OpenAI 使用
    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    /// 读超时 仅在未注入 transport 时生效
    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// 注入自定义 transport
    pub fn transport(mut self, transport: DynHttpTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 指定运行回调与流式调用的 tokio runtime 默认使用 build 时所在的 runtime
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// 构建最终的 AiService
    pub fn build(self) -> Result<AiService, LLMError> {
        let context = ProviderContext::new(self.provider, self.token, self.base_url.as_deref())?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_dyn_transport(self.read_timeout)?,
        };
        let registry = CallRegistry::new();
        let mut coordinator =
            Coordinator::new(registry.clone()).with_heartbeat_interval(self.heartbeat_interval);
        if let Some(runtime) = self.runtime {
            coordinator = coordinator.with_runtime(runtime);
        }

        Ok(AiService {
            transport,
            context: RwLock::new(context),
            organization: self.organization,
            registry,
            coordinator,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::StreamExt;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::*;
    use crate::http::HttpMethod;
    use crate::http::mock::MockTransport;
    use crate::lifecycle::CallEvent;
    use crate::provider::google::Content;
    use crate::provider::openai::ChatMessage;
    use crate::stream::StreamChunk;

    fn service(transport: &Arc<MockTransport>) -> AiService {
        AiService::builder()
            .token("sk-test")
            .organization("org-1")
            .transport(transport.clone())
            .build()
            .expect("service")
    }

    fn google_service(transport: &Arc<MockTransport>) -> AiService {
        AiService::builder()
            .provider(ProviderKind::Google)
            .token("g-key")
            .transport(transport.clone())
            .build()
            .expect("service")
    }

    fn chat_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages: vec![ChatMessage::user("hello")],
            ..ChatCompletionRequest::default()
        }
    }

    fn body_json(request: &HttpRequest) -> Value {
        serde_json::from_slice(request.body.as_deref().expect("body")).expect("json body")
    }

    #[tokio::test]
    async fn list_models_sends_auth_headers_and_unwraps_the_list() {
        let transport = Arc::new(MockTransport::new().reply(
            200,
            r#"{"object":"list","data":[{"id":"gpt-4","object":"model","owned_by":"openai"}]}"#,
        ));
        let models = service(&transport).list_models().await.expect("models");
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "gpt-4");

        let sent = transport.requests();
        assert_eq!(sent[0].method, HttpMethod::Get);
        assert_eq!(sent[0].url, "https://api.openai.com/v1/models");
        assert_eq!(
            sent[0].headers.get("Authorization").map(String::as_str),
            Some("Bearer sk-test")
        );
        assert_eq!(
            sent[0].headers.get("OpenAI-Organization").map(String::as_str),
            Some("org-1")
        );
    }

    #[tokio::test]
    async fn error_status_surfaces_the_parsed_provider_error() {
        let transport = Arc::new(MockTransport::new().reply(
            401,
            r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","code":"invalid_api_key"}}"#,
        ));
        let err = service(&transport)
            .create_chat_completion(&chat_request())
            .await
            .unwrap_err();
        match err {
            LLMError::ProviderHttp {
                provider,
                status,
                error,
                ..
            } => {
                assert_eq!(provider, "openai");
                assert_eq!(status, 401);
                assert_eq!(error.message(), "Incorrect API key provided");
                assert_eq!(error.code().as_deref(), Some("invalid_api_key"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_success_body_is_a_decode_error() {
        let transport = Arc::new(MockTransport::new().reply(200, "not json"));
        let err = service(&transport)
            .retrieve_file("file-1")
            .await
            .unwrap_err();
        match err {
            LLMError::Decode { raw, .. } => assert_eq!(raw, "not json"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_routes_use_delete_method() {
        let transport = Arc::new(
            MockTransport::new()
                .reply(200, r#"{"id":"file-1","object":"file","deleted":true}"#)
                .reply(200, r#"{"id":"ft-model","object":"model","deleted":true}"#),
        );
        let service = service(&transport);
        assert!(service.delete_file("file-1").await.expect("file").deleted);
        assert!(service.delete_fine_tune("ft-model").await.expect("model").deleted);

        let sent = transport.requests();
        assert_eq!(sent[0].method, HttpMethod::Delete);
        assert_eq!(sent[0].url, "https://api.openai.com/v1/files/file-1");
        assert_eq!(sent[1].url, "https://api.openai.com/v1/models/ft-model");
    }

    #[tokio::test]
    async fn mismatched_context_fails_before_sending() {
        let transport = Arc::new(MockTransport::new());
        let service = service(&transport);
        service.set_token("g-key", ProviderKind::Google);

        assert!(matches!(
            service.create_chat_completion(&chat_request()).await,
            Err(LLMError::Configuration { .. })
        ));
        assert!(matches!(
            service.stream_chat_completion(chat_request()),
            Err(LLMError::Configuration { .. })
        ));

        let (sender, mut events) = mpsc::unbounded_channel();
        service.chat_completion_with(&chat_request(), move |event: CallEvent<ChatCompletionResult>| {
            let _ = sender.send(matches!(event, CallEvent::Error(LLMError::Configuration { .. })));
        });
        let mut seen = Vec::new();
        while let Some(is_config_error) = events.recv().await {
            seen.push(is_config_error);
        }
        assert_eq!(seen.last(), Some(&true));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn google_operations_require_a_google_context() {
        let transport = Arc::new(MockTransport::new());
        let request = GenerateContentRequest {
            contents: vec![Content::user("hi")],
            ..GenerateContentRequest::default()
        };
        assert!(matches!(
            service(&transport).generate_content("gemini-pro", &request).await,
            Err(LLMError::Configuration { .. })
        ));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn generate_content_uses_api_key_header() {
        let transport = Arc::new(MockTransport::new().reply(
            200,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello"}]},"finishReason":"STOP"}]}"#,
        ));
        let request = GenerateContentRequest {
            contents: vec![Content::user("hi")],
            ..GenerateContentRequest::default()
        };
        let response = google_service(&transport)
            .generate_content("gemini-pro", &request)
            .await
            .expect("response");
        assert_eq!(response.text().as_deref(), Some("Hello"));

        let sent = transport.requests();
        assert_eq!(
            sent[0].url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
        );
        assert_eq!(
            sent[0].headers.get("x-goog-api-key").map(String::as_str),
            Some("g-key")
        );
        assert!(!sent[0].headers.contains_key("Authorization"));
    }

    #[tokio::test]
    async fn streaming_forces_stream_flag_and_accepts_event_stream() {
        let transport = Arc::new(MockTransport::new().stream(
            200,
            &[
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"!\"},\"finish_reason\":\"stop\"}]}\n\n",
                "data: [DONE]\n\n",
            ],
        ));
        let service = service(&transport);
        let stream = service
            .stream_chat_completion(chat_request())
            .expect("stream");
        assert_eq!(service.in_flight().len(), 1);

        let chunks: Vec<ChatCompletionChunk> =
            stream.map(|chunk| chunk.expect("chunk")).collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content(), Some("Hi"));
        assert!(chunks[1].is_finished());
        assert!(service.in_flight().is_empty());

        let sent = transport.requests();
        assert_eq!(body_json(&sent[0])["stream"], json!(true));
        assert_eq!(
            sent[0].headers.get("Accept").map(String::as_str),
            Some(EVENT_STREAM)
        );
    }

    #[tokio::test]
    async fn raw_frames_keep_the_sentinel_when_asked() {
        let transport = Arc::new(MockTransport::new().stream(200, &["data: {}\n\ndata: [DONE]\n\n"]));
        let frames: Vec<SseFrame> = service(&transport)
            .stream_frames("chat/completions", &json!({"stream": true}), true)
            .expect("stream")
            .map(|frame| frame.expect("frame"))
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_done());
    }

    #[tokio::test]
    async fn cancel_all_stops_streams_and_callback_calls() {
        let transport = Arc::new(
            MockTransport::new()
                .stream_open(&["data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n"])
                .stream_open(&[]),
        );
        let service = service(&transport);
        let mut raw = service
            .stream_chat_completion(chat_request())
            .expect("stream");
        assert!(raw.next().await.expect("item").is_ok());

        let (sender, mut events) = mpsc::unbounded_channel();
        service.stream_chat_completion_with(chat_request(), move |event: CallEvent<ChatCompletionChunk>| {
            let label = match event {
                CallEvent::Loading(on) => format!("loading:{on}"),
                CallEvent::Data(_) => "data".to_string(),
                CallEvent::Error(err) => format!("error:{err}"),
                CallEvent::Completed => "completed".to_string(),
            };
            let _ = sender.send(label);
        });
        assert_eq!(events.recv().await.as_deref(), Some("loading:true"));
        assert_eq!(service.in_flight().len(), 2);

        assert_eq!(service.cancel_all(), 2);
        assert!(raw.next().await.is_none());
        let mut rest = Vec::new();
        while let Some(event) = events.recv().await {
            rest.push(event);
        }
        assert_eq!(rest, vec!["loading:false", "completed"]);
        assert!(service.in_flight().is_empty());
    }

    #[test]
    fn calls_outside_a_runtime_report_a_configuration_error() {
        let transport = Arc::new(MockTransport::new());
        let service = service(&transport);

        let (sender, receiver) = std::sync::mpsc::channel();
        service.list_models_with(move |event: CallEvent<Vec<Model>>| {
            let _ = sender.send(matches!(
                event,
                CallEvent::Error(LLMError::Configuration { ref field, .. }) if field == "runtime"
            ));
        });
        assert_eq!(receiver.try_iter().collect::<Vec<_>>(), vec![true]);

        assert!(matches!(
            service.stream_chat_completion(chat_request()),
            Err(LLMError::Configuration { .. })
        ));
        assert!(service.in_flight().is_empty());
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn bound_runtime_serves_callers_on_plain_threads() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let transport = Arc::new(MockTransport::new().reply(
            200,
            r#"{"object":"list","data":[{"id":"gpt-4"}]}"#,
        ));
        let service = AiService::builder()
            .token("sk-test")
            .transport(transport.clone())
            .runtime(runtime.handle().clone())
            .build()
            .expect("service");

        let (sender, receiver) = std::sync::mpsc::channel();
        service.list_models_with(move |event: CallEvent<Vec<Model>>| {
            if let CallEvent::Data(models) = event {
                let _ = sender.send(models.len());
            }
        });
        assert_eq!(receiver.recv_timeout(Duration::from_secs(2)), Ok(1));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn builder_rejects_invalid_base_url() {
        let transport = Arc::new(MockTransport::new());
        let err = AiService::builder()
            .token("sk")
            .base_url("api.openai.com")
            .transport(transport)
            .build()
            .unwrap_err();
        assert!(matches!(err, LLMError::Configuration { .. }));
    }
}
