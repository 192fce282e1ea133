//! Stage agents: [`StepExecutor`] implementations backed by a [`ChatBackend`].
//!
//! Executors run on blocking worker threads. Each agent keeps a handle to the
//! runtime it was built on and blocks on the async client from there.

use crate::{ChatBackend, ChatRequest};
use deal_core::{ProviderConfig, StageEmitter};
use deal_flow::StageExecutors;
use futures::StreamExt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

mod extraction;
mod memo;
mod research;
mod risk_scan;

pub use extraction::ExtractionAgent;
pub use memo::MemoAgent;
pub use research::ResearchAgent;
pub use risk_scan::RiskScanAgent;

/// Generation parameters shared by every agent
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    /// Model name sent with each request
    pub model: String,
    /// Sampling temperature; provider default when unset
    pub temperature: Option<f32>,
    /// Completion token cap
    pub max_tokens: u32,
}

impl From<&ProviderConfig> for GenerationSettings {
    fn from(provider: &ProviderConfig) -> Self {
        Self {
            model: provider.model.clone(),
            temperature: provider.temperature,
            max_tokens: provider.max_tokens,
        }
    }
}

/// What every agent needs to talk to the model
#[derive(Clone)]
pub struct AgentContext {
    backend: Arc<dyn ChatBackend>,
    runtime: Handle,
    settings: GenerationSettings,
}

impl AgentContext {
    /// Bind a backend to the runtime that will drive its requests
    pub fn new(backend: Arc<dyn ChatBackend>, runtime: Handle, settings: GenerationSettings) -> Self {
        Self {
            backend,
            runtime,
            settings,
        }
    }

    /// Model used for requests
    pub fn model(&self) -> &str {
        &self.settings.model
    }

    pub(crate) fn request(&self, system: &str, user: &str) -> ChatRequest {
        ChatRequest::new(self.settings.model.clone(), system, user)
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens)
    }

    /// Stream a completion, forwarding every delta to `emitter`.
    ///
    /// Stops reading once the workflow is cancelled and returns what arrived so far.
    pub(crate) fn stream_text(
        &self,
        emitter: &dyn StageEmitter,
        request: ChatRequest,
    ) -> anyhow::Result<String> {
        let text = self.runtime.block_on(async {
            let mut deltas = self.backend.stream(request).await?;
            let mut text = String::new();
            while let Some(delta) = deltas.next().await {
                if emitter.is_cancelled() {
                    debug!("Workflow cancelled, dropping response stream");
                    break;
                }
                let delta = delta?;
                text.push_str(&delta);
                emitter.emit(delta);
            }
            Ok::<_, anyhow::Error>(text)
        })?;

        if text.trim().is_empty() && !emitter.is_cancelled() {
            anyhow::bail!("Provider returned an empty response (content filter or API issue)");
        }
        Ok(text)
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

pub(crate) fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Dispatch table wiring every stage to its agent.
///
/// `runtime` must outlive the workers; pass the handle of the runtime the
/// engine runs on.
pub fn build_executors(
    backend: Arc<dyn ChatBackend>,
    runtime: Handle,
    settings: GenerationSettings,
) -> StageExecutors {
    let agent = AgentContext::new(backend, runtime, settings);
    StageExecutors {
        research: Arc::new(ResearchAgent::new(agent.clone())),
        extraction: Arc::new(ExtractionAgent::new(agent.clone())),
        risk_scan: Arc::new(RiskScanAgent::new(agent.clone())),
        memo: Arc::new(MemoAgent::new(agent)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backend and recording emitter for agent tests

    use super::*;
    use crate::DeltaStream;
    use async_trait::async_trait;
    use deal_core::{StageInput, StepExecutor};
    use deal_protocol::{DataRoomDocument, DealContext, StageName, WorkflowId};
    use futures::stream;
    use serde_json::Value;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Replies in call order; every reply is streamed in 3-character deltas
    #[derive(Default)]
    pub struct ScriptedBackend {
        replies: Mutex<VecDeque<anyhow::Result<String>>>,
        pub requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        pub fn new<I: IntoIterator<Item = &'static str>>(replies: I) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
                requests: Mutex::default(),
            })
        }

        pub fn failing(message: &'static str) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::from([Err(anyhow::anyhow!(message))])),
                requests: Mutex::default(),
            })
        }

        pub fn user_prompts(&self) -> Vec<String> {
            self.requests
                .lock()
                .expect("lock")
                .iter()
                .map(|r| r.messages[1].content.clone())
                .collect()
        }

        fn next_reply(&self, request: ChatRequest) -> anyhow::Result<String> {
            self.requests.lock().expect("lock").push(request);
            self.replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok("unscripted".to_string()))
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        fn default_model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: ChatRequest) -> anyhow::Result<String> {
            self.next_reply(request)
        }

        async fn stream(&self, request: ChatRequest) -> anyhow::Result<DeltaStream> {
            let reply = self.next_reply(request)?;
            let chars: Vec<char> = reply.chars().collect();
            let deltas: Vec<anyhow::Result<String>> = chars
                .chunks(3)
                .map(|c| Ok(c.iter().collect::<String>()))
                .collect();
            Ok(stream::iter(deltas).boxed())
        }
    }

    #[derive(Default)]
    pub struct RecordingEmitter {
        pub fragments: Mutex<Vec<String>>,
        pub progress: Mutex<Vec<(u8, String)>>,
        pub cancelled: AtomicBool,
    }

    impl RecordingEmitter {
        pub fn text(&self) -> String {
            self.fragments.lock().expect("lock").concat()
        }

        pub fn percents(&self) -> Vec<u8> {
            self.progress.lock().expect("lock").iter().map(|(p, _)| *p).collect()
        }
    }

    impl StageEmitter for RecordingEmitter {
        fn emit(&self, fragment: String) {
            self.fragments.lock().expect("lock").push(fragment);
        }

        fn progress(&self, percent: u8, message: &str) {
            self.progress
                .lock()
                .expect("lock")
                .push((percent, message.to_string()));
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    pub fn settings() -> GenerationSettings {
        GenerationSettings {
            model: "scripted".into(),
            temperature: None,
            max_tokens: 8000,
        }
    }

    pub fn input(stage: StageName) -> StageInput {
        StageInput {
            workflow_id: WorkflowId::new(),
            stage,
            attempt: 1,
            context: Arc::new(
                DealContext::new("Bizzi", "https://bizzi.vn")
                    .with_sector("Fintech")
                    .with_region("Vietnam"),
            ),
            documents: Arc::new(vec![
                DataRoomDocument::new("deck.pdf", "Bizzi automates invoices for 500 customers."),
                DataRoomDocument::new("financials.xlsx", "Revenue 2024 | $5M"),
            ]),
            prior_outputs: BTreeMap::new(),
            feedback: None,
        }
    }

    /// Run a blocking executor the way the engine does
    pub async fn run(
        executor: Arc<dyn StepExecutor>,
        input: StageInput,
        emitter: Arc<RecordingEmitter>,
    ) -> anyhow::Result<Value> {
        tokio::task::spawn_blocking(move || executor.execute(input, emitter.as_ref()))
            .await
            .expect("join")
    }

    pub fn agent(backend: Arc<ScriptedBackend>) -> AgentContext {
        AgentContext::new(backend, Handle::current(), settings())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use deal_core::StageInput;
    use deal_protocol::StageName;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_stream_text_forwards_deltas_in_order() {
        let backend = ScriptedBackend::new(["hello world"]);
        let agent = agent(backend.clone());
        let emitter = Arc::new(RecordingEmitter::default());

        let sink = Arc::clone(&emitter);
        let text = tokio::task::spawn_blocking(move || {
            agent.stream_text(sink.as_ref(), agent.request("sys", "user"))
        })
        .await
        .expect("join")
        .expect("text");

        assert_eq!(text, "hello world");
        assert_eq!(
            *emitter.fragments.lock().expect("lock"),
            vec!["hel", "lo ", "wor", "ld"]
        );
        let requests = backend.requests.lock().expect("lock");
        assert_eq!(requests[0].max_tokens, Some(8000));
        assert_eq!(requests[0].model, "scripted");
    }

    #[tokio::test]
    async fn test_stream_text_stops_when_cancelled() {
        let backend = ScriptedBackend::new(["a long reply that is never read"]);
        let agent = agent(backend);
        let emitter = Arc::new(RecordingEmitter::default());
        emitter.cancelled.store(true, Ordering::SeqCst);

        let sink = Arc::clone(&emitter);
        let text = tokio::task::spawn_blocking(move || {
            agent.stream_text(sink.as_ref(), agent.request("sys", "user"))
        })
        .await
        .expect("join")
        .expect("text");

        assert_eq!(text, "");
        assert!(emitter.fragments.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_stream_text_rejects_empty_reply() {
        let agent = agent(ScriptedBackend::new([""]));
        let emitter = Arc::new(RecordingEmitter::default());
        let sink = Arc::clone(&emitter);
        let result = tokio::task::spawn_blocking(move || {
            agent.stream_text(sink.as_ref(), agent.request("sys", "user"))
        })
        .await
        .expect("join");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_build_executors_wires_memo_agent() {
        let backend = ScriptedBackend::new(["<p>memo</p>"]);
        let executors = build_executors(backend.clone(), Handle::current(), settings());

        let mut memo_input: StageInput = input(StageName::Memo);
        memo_input.documents = Arc::new(Vec::new());
        let value: Value = run(
            executors.resolve(StageName::Memo),
            memo_input,
            Arc::new(RecordingEmitter::default()),
        )
        .await
        .expect("memo");

        assert_eq!(value["memo_content"], "<p>memo</p>");
        assert_eq!(backend.requests.lock().expect("lock").len(), 1);
    }
}
