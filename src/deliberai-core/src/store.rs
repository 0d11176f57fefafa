//! Deliberation state store.
//!
//! Holds rounds, responses, per-model column status and the selection set,
//! and turns user intents into provider calls. The store is an explicit
//! handle owned by the application; clones share the same state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::auth::{AlwaysValid, SessionGate};
use crate::error::{DeliberationError, ProviderError};
use crate::models::{ModelInfo, ModelRegistry};
use crate::providers::{AdapterRegistry, ChatMessage};
use crate::response::{Response, sanitize_response};
use crate::selection::SelectionSet;
use crate::transcript;

/// Overall machine state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliberationStatus {
    #[default]
    Idle,
    /// A round is in flight.
    Loading,
    /// Round finished, waiting for the user.
    Deliberating,
    /// Synthesis or full transcript produced.
    Completed,
}

/// Outcome of a model's call in the current round.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Read model handed to the presentation layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliberationSnapshot {
    pub status: DeliberationStatus,
    pub round: u32,
    pub prompt: String,
    /// Models eligible for the next round, in selection order.
    pub models: Vec<String>,
    pub responses: Vec<Response>,
    pub columns: BTreeMap<String, ColumnStatus>,
    pub selection: SelectionSet,
    pub synthesis_result: Option<String>,
    pub full_transcript_result: Option<String>,
    pub is_judging: bool,
    pub judge_error: Option<String>,
    pub auth_required: bool,
    pub last_round_all_failed: bool,
}

impl DeliberationSnapshot {
    pub fn column_status(&self, model_id: &str) -> ColumnStatus {
        self.columns.get(model_id).copied().unwrap_or_default()
    }

    /// Responses of one model, by round.
    pub fn column(&self, model_id: &str) -> Vec<&Response> {
        let mut responses: Vec<&Response> = self
            .responses
            .iter()
            .filter(|r| r.model_id == model_id)
            .collect();
        responses.sort_by_key(|r| r.round);
        responses
    }

    pub fn response(&self, id: &str) -> Option<&Response> {
        self.responses.iter().find(|r| r.id == id)
    }

    pub fn valid_responses(&self) -> impl Iterator<Item = &Response> {
        self.responses.iter().filter(|r| !r.is_error())
    }
}

/// Result of one settled round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSummary {
    pub round: u32,
    pub succeeded: usize,
    pub failed: usize,
}

impl RoundSummary {
    pub fn all_failed(&self) -> bool {
        self.succeeded == 0
    }
}

/// Events emitted while the store changes.
#[derive(Debug, Clone)]
pub enum DeliberationEvent {
    RoundStarted { round: u32, models: Vec<String> },
    ColumnUpdated {
        round: u32,
        model_id: String,
        status: ColumnStatus,
    },
    RoundSettled(RoundSummary),
    JudgeStarted { model_id: String },
    JudgeFinished { success: bool },
    Completed,
    AuthRequired,
}

/// Callback for store events. Invoked from adapter tasks, never under the state lock.
pub type EventCallback = Arc<dyn Fn(DeliberationEvent) + Send + Sync>;

const UNSETTLED_CALL_ERROR: &str = "Falha ao obter resposta do modelo nesta rodada.";

struct State {
    /// Bumped on every start/reset; results carrying an older epoch are dropped.
    epoch: u64,
    view: DeliberationSnapshot,
}

struct Inner {
    adapters: AdapterRegistry,
    models: ModelRegistry,
    system_prompt: String,
    session: RwLock<Arc<dyn SessionGate>>,
    callback: RwLock<Option<EventCallback>>,
    state: Mutex<State>,
}

/// Handle to the deliberation state.
#[derive(Clone)]
pub struct DeliberationStore {
    inner: Arc<Inner>,
}

impl DeliberationStore {
    pub fn new(
        adapters: AdapterRegistry,
        models: ModelRegistry,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapters,
                models,
                system_prompt: system_prompt.into(),
                session: RwLock::new(Arc::new(AlwaysValid)),
                callback: RwLock::new(None),
                state: Mutex::new(State {
                    epoch: 0,
                    view: DeliberationSnapshot::default(),
                }),
            }),
        }
    }

    /// Replace the session gate consulted before any provider call.
    pub fn set_session_gate(&self, gate: Arc<dyn SessionGate>) {
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = gate;
    }

    /// Register the event callback, replacing any previous one.
    pub fn subscribe(&self, callback: EventCallback) {
        *self
            .inner
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.inner.models
    }

    pub fn snapshot(&self) -> DeliberationSnapshot {
        self.inner.state().view.clone()
    }

    pub fn status(&self) -> DeliberationStatus {
        self.inner.state().view.status
    }

    pub fn column_status(&self, model_id: &str) -> ColumnStatus {
        self.inner.state().view.column_status(model_id)
    }

    /// Start a fresh deliberation: round 1 with `[system, user: prompt]` for every model.
    ///
    /// Invalidates anything still in flight from a previous deliberation.
    pub async fn start_deliberation(
        &self,
        prompt: &str,
        model_ids: &[String],
    ) -> Result<RoundSummary, DeliberationError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(DeliberationError::EmptyPrompt);
        }
        let mut models: Vec<String> = Vec::with_capacity(model_ids.len());
        for id in model_ids {
            if !models.contains(id) {
                models.push(id.clone());
            }
        }
        if models.is_empty() {
            return Err(DeliberationError::NoModelsSelected);
        }
        self.inner.require_session().await?;

        let messages = vec![
            ChatMessage::system(self.inner.system_prompt.clone()),
            ChatMessage::user(prompt),
        ];

        let epoch = {
            let mut state = self.inner.state();
            state.epoch += 1;
            state.view = DeliberationSnapshot {
                status: DeliberationStatus::Loading,
                round: 1,
                prompt: prompt.to_string(),
                columns: loading_columns(&models),
                models: models.clone(),
                ..DeliberationSnapshot::default()
            };
            state.epoch
        };

        info!(models = models.len(), "starting deliberation");
        self.inner.run_round(epoch, 1, models, messages).await
    }

    /// Advance to the next round with the selected responses as shared context.
    pub async fn start_next_round(&self) -> Result<RoundSummary, DeliberationError> {
        self.inner.refresh_session().await;
        let (epoch, round, models, messages) = {
            let mut state = self.inner.state();
            let view = &state.view;
            if view.status != DeliberationStatus::Deliberating {
                return Err(DeliberationError::InvalidStatus(view.status));
            }
            if view.is_judging {
                return Err(DeliberationError::JudgeInFlight);
            }
            if view.models.is_empty() {
                return Err(DeliberationError::NoEligibleModels);
            }
            if view.selection.is_empty() {
                return Err(DeliberationError::EmptySelection);
            }
            if !self.inner.session_valid() {
                state.view.auth_required = true;
                drop(state);
                self.inner.emit(DeliberationEvent::AuthRequired);
                return Err(DeliberationError::AuthRequired);
            }

            let messages = transcript::next_round_context(
                &self.inner.system_prompt,
                &view.prompt,
                &view.responses,
                &view.selection,
            );

            let view = &mut state.view;
            view.round += 1;
            view.status = DeliberationStatus::Loading;
            view.columns = loading_columns(&view.models);
            view.last_round_all_failed = false;
            (state.epoch, state.view.round, state.view.models.clone(), messages)
        };

        info!(round, models = models.len(), "starting next round");
        self.inner.run_round(epoch, round, models, messages).await
    }

    /// Exclude a model from subsequent rounds. Returns `false` if it was not eligible.
    pub fn remove_model(&self, model_id: &str) -> bool {
        let mut state = self.inner.state();
        let before = state.view.models.len();
        state.view.models.retain(|m| m != model_id);
        state.view.models.len() != before
    }

    /// Make a model eligible for subsequent rounds. Returns `false` if it already was.
    pub fn add_model(&self, model_id: &str) -> bool {
        let mut state = self.inner.state();
        if state.view.models.iter().any(|m| m == model_id) {
            return false;
        }
        state.view.models.push(model_id.to_string());
        true
    }

    /// Flip membership of a response. Error responses and unknown ids are left out.
    ///
    /// Returns whether the response is selected afterwards.
    pub fn toggle_response_selection(&self, response_id: &str) -> bool {
        let mut state = self.inner.state();
        let selectable = state
            .view
            .response(response_id)
            .is_some_and(|r| !r.is_error());
        if !selectable {
            return false;
        }
        if state.view.selection.remove(response_id) {
            false
        } else {
            state.view.selection.insert(response_id.to_string())
        }
    }

    /// Select every non-error response across all rounds. Returns the selection size.
    pub fn select_all_responses(&self) -> usize {
        let mut state = self.inner.state();
        let ids: Vec<String> = state.view.valid_responses().map(|r| r.id.clone()).collect();
        for id in ids {
            state.view.selection.insert(id);
        }
        state.view.selection.len()
    }

    pub fn clear_response_selection(&self) {
        self.inner.state().view.selection.clear();
    }

    /// Ask `judge_model_id` to weigh the selected responses and issue a verdict.
    pub async fn request_judge_synthesis(
        &self,
        judge_model_id: &str,
    ) -> Result<String, DeliberationError> {
        self.inner.refresh_session().await;
        let (epoch, judge, prompt) = {
            let mut state = self.inner.state();
            let view = &state.view;
            if view.status != DeliberationStatus::Deliberating {
                return Err(DeliberationError::InvalidStatus(view.status));
            }
            if view.is_judging {
                return Err(DeliberationError::JudgeInFlight);
            }
            if view.selection.is_empty() {
                return Err(DeliberationError::EmptySelection);
            }
            if !self.inner.session_valid() {
                state.view.auth_required = true;
                drop(state);
                self.inner.emit(DeliberationEvent::AuthRequired);
                return Err(DeliberationError::AuthRequired);
            }
            let judge: ModelInfo = match self.inner.models.resolve(judge_model_id) {
                Ok(info) => info.clone(),
                Err(e) => {
                    state.view.judge_error = Some(e.to_string());
                    return Err(e.into());
                }
            };

            let prompt = transcript::synthesis_prompt(&view.prompt, &view.responses, &view.selection);
            state.view.is_judging = true;
            state.view.judge_error = None;
            (state.epoch, judge, prompt)
        };

        info!(judge = %judge.id, "requesting synthesis");
        self.inner.emit(DeliberationEvent::JudgeStarted {
            model_id: judge.id.clone(),
        });

        let result = self
            .inner
            .adapters
            .invoke(&judge, &prompt.to_messages())
            .await
            .map(|text| sanitize_response(&text))
            .and_then(|text| {
                if text.is_empty() {
                    Err(ProviderError::Upstream {
                        provider: judge.provider.to_string(),
                        detail: "resposta vazia".to_string(),
                    })
                } else {
                    Ok(text)
                }
            });

        {
            let mut state = self.inner.state();
            if state.epoch != epoch {
                debug!("discarding synthesis from a superseded deliberation");
                return Err(DeliberationError::Superseded);
            }
            state.view.is_judging = false;
            match &result {
                Ok(text) => {
                    state.view.synthesis_result = Some(text.clone());
                    state.view.status = DeliberationStatus::Completed;
                }
                Err(e) => {
                    warn!(judge = %judge.id, "synthesis failed: {}", e);
                    state.view.judge_error = Some(e.to_string());
                    if *e == ProviderError::AuthRequired {
                        state.view.auth_required = true;
                    }
                }
            }
        }

        self.inner.emit(DeliberationEvent::JudgeFinished {
            success: result.is_ok(),
        });
        match result {
            Ok(text) => {
                self.inner.emit(DeliberationEvent::Completed);
                Ok(text)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Finish by reproducing the selected responses in full. No provider call.
    pub fn end_with_full_transcript(&self) -> Result<String, DeliberationError> {
        let document = {
            let mut state = self.inner.state();
            let view = &state.view;
            if view.status == DeliberationStatus::Loading || view.status == DeliberationStatus::Idle {
                return Err(DeliberationError::InvalidStatus(view.status));
            }
            if view.is_judging {
                return Err(DeliberationError::JudgeInFlight);
            }
            if view.selection.is_empty() {
                return Err(DeliberationError::EmptySelection);
            }

            let document = transcript::full_transcript(&view.responses, &view.selection);
            state.view.full_transcript_result = Some(document.clone());
            state.view.status = DeliberationStatus::Completed;
            document
        };

        self.inner.emit(DeliberationEvent::Completed);
        Ok(document)
    }

    /// Close the synthesis view. The deliberation stays completed.
    pub fn clear_synthesis(&self) {
        self.inner.state().view.synthesis_result = None;
    }

    /// Close the full-transcript view. The deliberation stays completed.
    pub fn clear_full_transcript(&self) {
        self.inner.state().view.full_transcript_result = None;
    }

    /// Drop everything and return to idle. In-flight results are discarded.
    pub fn reset(&self) {
        let mut state = self.inner.state();
        state.epoch += 1;
        state.view = DeliberationSnapshot::default();
    }

    /// Markdown export of the whole history.
    pub fn export_markdown(&self, include_transcript: bool) -> String {
        let state = self.inner.state();
        let view = &state.view;
        transcript::export_markdown(
            &view.responses,
            view.synthesis_result.as_deref(),
            view.full_transcript_result
                .as_deref()
                .filter(|_| include_transcript),
        )
    }
}

fn loading_columns(models: &[String]) -> BTreeMap<String, ColumnStatus> {
    models
        .iter()
        .map(|m| (m.clone(), ColumnStatus::Loading))
        .collect()
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_gate(&self) -> Arc<dyn SessionGate> {
        Arc::clone(&self.session.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn session_valid(&self) -> bool {
        self.session_gate().is_session_valid()
    }

    /// Give the gate a chance to renew an expired session before it is checked.
    async fn refresh_session(&self) -> bool {
        let gate = self.session_gate();
        gate.ensure_valid().await
    }

    async fn require_session(&self) -> Result<(), DeliberationError> {
        if self.refresh_session().await {
            return Ok(());
        }
        self.state().view.auth_required = true;
        self.emit(DeliberationEvent::AuthRequired);
        Err(DeliberationError::AuthRequired)
    }

    fn emit(&self, event: DeliberationEvent) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    /// Fan out one call per model and wait until every one has settled.
    async fn run_round(
        self: &Arc<Self>,
        epoch: u64,
        round: u32,
        models: Vec<String>,
        messages: Vec<ChatMessage>,
    ) -> Result<RoundSummary, DeliberationError> {
        self.emit(DeliberationEvent::RoundStarted {
            round,
            models: models.clone(),
        });

        let messages = Arc::new(messages);
        let mut join_set = JoinSet::new();
        for model_id in models {
            let inner = Arc::clone(self);
            let messages = Arc::clone(&messages);
            join_set.spawn(async move { inner.call_model(epoch, round, model_id, &messages).await });
        }

        let mut summary = RoundSummary {
            round,
            succeeded: 0,
            failed: 0,
        };
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(true)) => summary.succeeded += 1,
                Ok(Some(false)) => summary.failed += 1,
                Ok(None) => {}
                Err(e) => warn!("model task failed: {}", e),
            }
        }

        self.settle_round(epoch, summary)
    }

    /// Close the round barrier. Columns whose task never reported become errors.
    fn settle_round(
        &self,
        epoch: u64,
        mut summary: RoundSummary,
    ) -> Result<RoundSummary, DeliberationError> {
        let mut orphaned = Vec::new();
        {
            let mut state = self.state();
            if state.epoch != epoch || state.view.round != summary.round {
                debug!(round = summary.round, "round superseded before settling");
                return Err(DeliberationError::Superseded);
            }

            let view = &mut state.view;
            for (model_id, status) in view.columns.iter_mut() {
                if *status == ColumnStatus::Loading {
                    *status = ColumnStatus::Error;
                    orphaned.push(model_id.clone());
                }
            }
            for model_id in &orphaned {
                let name = self.models.display_name(model_id);
                view.responses.push(Response::failure(
                    summary.round,
                    model_id.clone(),
                    name,
                    UNSETTLED_CALL_ERROR,
                    0,
                ));
            }
            summary.failed += orphaned.len();

            view.status = DeliberationStatus::Deliberating;
            view.last_round_all_failed = summary.all_failed();
        }

        for model_id in orphaned {
            self.emit(DeliberationEvent::ColumnUpdated {
                round: summary.round,
                model_id,
                status: ColumnStatus::Error,
            });
        }

        if summary.all_failed() {
            warn!(round = summary.round, "every model failed this round");
        } else {
            info!(
                round = summary.round,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "round settled"
            );
        }
        self.emit(DeliberationEvent::RoundSettled(summary));
        Ok(summary)
    }

    /// One model's call. Returns `None` when the result was stale and dropped.
    async fn call_model(
        &self,
        epoch: u64,
        round: u32,
        model_id: String,
        messages: &[ChatMessage],
    ) -> Option<bool> {
        let started = Instant::now();
        let (model_name, result) = match self.models.resolve(&model_id) {
            Ok(info) => (info.name.clone(), self.adapters.invoke(info, messages).await),
            Err(e) => (self.models.display_name(&model_id), Err(e)),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let auth_failed = matches!(result, Err(ProviderError::AuthRequired));
        let response = match result {
            Ok(text) => Response::success(round, &model_id, model_name, &text, duration_ms),
            Err(e) => {
                warn!(model = %model_id, round, "model call failed: {}", e);
                Response::failure(round, &model_id, model_name, e.to_string(), duration_ms)
            }
        };

        let success = self.record(epoch, response, auth_failed)?;
        if auth_failed {
            self.emit(DeliberationEvent::AuthRequired);
        }
        Some(success)
    }

    /// Append a response and update its column in one step.
    fn record(&self, epoch: u64, response: Response, auth_failed: bool) -> Option<bool> {
        let status = if response.is_error() {
            ColumnStatus::Error
        } else {
            ColumnStatus::Success
        };
        let round = response.round;
        let model_id = response.model_id.clone();

        {
            let mut state = self.state();
            if state.epoch != epoch || state.view.round != round {
                debug!(model = %model_id, round, "discarding stale response");
                return None;
            }
            let view = &mut state.view;
            if view
                .responses
                .iter()
                .any(|r| r.model_id == model_id && r.round == round)
            {
                return None;
            }
            view.columns.insert(model_id.clone(), status);
            if auth_failed {
                view.auth_required = true;
            }
            view.responses.push(response);
        }

        self.emit(DeliberationEvent::ColumnUpdated {
            round,
            model_id,
            status,
        });
        Some(status == ColumnStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CostTier, Provider};
    use crate::providers::ProviderAdapter;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    enum Reply {
        Text(&'static str),
        Fail(ProviderError),
        Hang,
    }

    /// In-process adapter replying from a script and recording every call.
    struct Scripted {
        replies: Mutex<HashMap<String, (Duration, Reply)>>,
        calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    }

    impl Scripted {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn reply(&self, model: &str, delay_ms: u64, reply: Reply) {
            self.replies
                .lock()
                .unwrap()
                .insert(model.to_string(), (Duration::from_millis(delay_ms), reply));
        }

        fn calls(&self) -> Vec<(String, Vec<ChatMessage>)> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_to(&self, model: &str) -> Vec<Vec<ChatMessage>> {
            self.calls()
                .into_iter()
                .filter(|(m, _)| m == model)
                .map(|(_, msgs)| msgs)
                .collect()
        }
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        async fn invoke(&self, model: &str, messages: &[ChatMessage]) -> Result<String, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), messages.to_vec()));
            let (delay, reply) = self
                .replies
                .lock()
                .unwrap()
                .get(model)
                .cloned()
                .unwrap_or((Duration::ZERO, Reply::Text("## Análise\nok\n## Conclusão Final\nok")));
            tokio::time::sleep(delay).await;
            match reply {
                Reply::Text(text) => Ok(text.to_string()),
                Reply::Fail(e) => Err(e),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok("too late".to_string())
                }
            }
        }
    }

    struct Gate(AtomicBool);

    impl SessionGate for Gate {
        fn is_session_valid(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn store_with(adapter: Arc<Scripted>) -> DeliberationStore {
        let registry = AdapterRegistry::new(Duration::from_millis(300))
            .with_adapter(Provider::Local, adapter);
        let models = ModelRegistry::new(vec![
            ModelInfo::new("A", "Model A", Provider::Local, CostTier::Free),
            ModelInfo::new("B", "Model B", Provider::Local, CostTier::Free),
            ModelInfo::new("C", "Model C", Provider::Local, CostTier::Free),
            ModelInfo::new("judge/model", "Judge", Provider::Local, CostTier::Free),
        ]);
        DeliberationStore::new(registry, models, "SYSTEM")
    }

    fn ids(models: &[&str]) -> Vec<String> {
        models.iter().map(|m| m.to_string()).collect()
    }

    fn response_id(store: &DeliberationStore, model: &str, round: u32) -> String {
        store
            .snapshot()
            .responses
            .iter()
            .find(|r| r.model_id == model && r.round == round)
            .map(|r| r.id.clone())
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_one_both_succeed() {
        let adapter = Scripted::new();
        adapter.reply("A", 10, Reply::Text("## Análise\nA pensa\n## Conclusão Final\nA diz"));
        adapter.reply("B", 5, Reply::Text("B diz"));
        let store = store_with(adapter.clone());

        let summary = store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();

        assert_eq!(summary, RoundSummary { round: 1, succeeded: 2, failed: 0 });
        let snap = store.snapshot();
        assert_eq!(snap.round, 1);
        assert_eq!(snap.status, DeliberationStatus::Deliberating);
        assert_eq!(snap.responses.len(), 2);
        assert!(snap.responses.iter().all(|r| r.round == 1 && r.error.is_none()));
        assert_eq!(snap.column_status("A"), ColumnStatus::Success);
        assert_eq!(snap.column_status("B"), ColumnStatus::Success);
        assert_eq!(snap.column("A")[0].conclusion, "A diz");
        assert_eq!(snap.column("A")[0].model_name, "Model A");

        // Round one sends exactly [system, user: prompt].
        for msgs in adapter.calls_to("A").into_iter().chain(adapter.calls_to("B")) {
            assert_eq!(msgs, vec![ChatMessage::system("SYSTEM"), ChatMessage::user("X")]);
        }
    }

    #[tokio::test]
    async fn test_timeout_isolated_to_one_column() {
        let adapter = Scripted::new();
        adapter.reply("A", 0, Reply::Hang);
        adapter.reply("B", 5, Reply::Text("B ok"));
        let store = store_with(adapter);

        let summary = store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        let snap = store.snapshot();
        assert_eq!(snap.status, DeliberationStatus::Deliberating);
        assert_eq!(snap.column_status("A"), ColumnStatus::Error);
        assert_eq!(snap.column_status("B"), ColumnStatus::Success);

        let b = snap.column("B");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].round, 1);
        assert!(b[0].error.is_none());

        let a = snap.column("A");
        assert!(a[0].error.as_deref().unwrap().contains("Tempo limite"));
    }

    #[tokio::test]
    async fn test_next_round_uses_only_selected_responses() {
        let adapter = Scripted::new();
        adapter.reply("A", 0, Reply::Text("## Análise\nA-round1-analysis\n## Conclusão Final\nA-round1-conclusion"));
        adapter.reply("B", 0, Reply::Text("## Análise\nB-round1-analysis\n## Conclusão Final\nB-round1-conclusion"));
        let store = store_with(adapter.clone());
        store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();

        let b1 = response_id(&store, "B", 1);
        assert!(store.toggle_response_selection(&b1));

        let summary = store.start_next_round().await.unwrap();
        assert_eq!(summary.round, 2);
        assert_eq!(store.snapshot().round, 2);

        for model in ["A", "B"] {
            let calls = adapter.calls_to(model);
            assert_eq!(calls.len(), 2);
            let context: String = calls[1].iter().map(|m| m.content.as_str()).collect();
            assert!(context.contains("B-round1-analysis"));
            assert!(context.contains("B-round1-conclusion"));
            assert!(!context.contains("A-round1-analysis"));
            assert!(!context.contains("A-round1-conclusion"));
        }
    }

    #[tokio::test]
    async fn test_failed_model_stays_eligible() {
        let adapter = Scripted::new();
        adapter.reply(
            "A",
            0,
            Reply::Fail(ProviderError::RateLimited {
                provider: "Local".to_string(),
                detail: "slow down".to_string(),
            }),
        );
        let store = store_with(adapter.clone());
        store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();
        store.select_all_responses();

        adapter.reply("A", 0, Reply::Text("recovered"));
        store.start_next_round().await.unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.column_status("A"), ColumnStatus::Success);
        assert_eq!(adapter.calls_to("A").len(), 2);
    }

    #[tokio::test]
    async fn test_removed_model_is_not_called_and_loses_its_column() {
        let adapter = Scripted::new();
        let store = store_with(adapter.clone());
        store.start_deliberation("X", &ids(&["A", "B", "C"])).await.unwrap();
        store.select_all_responses();

        assert!(store.remove_model("C"));
        assert!(!store.remove_model("C"));
        store.start_next_round().await.unwrap();

        let snap = store.snapshot();
        assert_eq!(
            snap.columns.keys().cloned().collect::<Vec<_>>(),
            vec!["A".to_string(), "B".to_string()]
        );
        assert!(snap.columns.values().all(|s| *s != ColumnStatus::Loading));
        assert_eq!(adapter.calls_to("C").len(), 1);

        assert!(store.add_model("C"));
        assert!(!store.add_model("C"));
    }

    #[tokio::test]
    async fn test_judge_synthesis_success() {
        let adapter = Scripted::new();
        adapter.reply("A", 0, Reply::Text("## Análise\nalpha-text\n## Conclusão Final\nalpha"));
        adapter.reply("B", 0, Reply::Text("## Análise\nbeta-text\n## Conclusão Final\nbeta"));
        adapter.reply(
            "judge/model",
            0,
            Reply::Text("## Avaliação do Debate\nbom\n## Veredito Final\nalpha"),
        );
        let store = store_with(adapter.clone());
        store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();
        assert_eq!(store.select_all_responses(), 2);
        let before = adapter.calls().len();

        let synthesis = store.request_judge_synthesis("judge/model").await.unwrap();

        let calls = adapter.calls();
        assert_eq!(calls.len(), before + 1);
        let (model, messages) = calls.last().unwrap();
        assert_eq!(model, "judge/model");
        let prompt: String = messages.iter().map(|m| m.content.as_str()).collect();
        assert!(prompt.contains("alpha-text") && prompt.contains("beta-text"));

        assert!(!synthesis.is_empty());
        let snap = store.snapshot();
        assert_eq!(snap.status, DeliberationStatus::Completed);
        assert_eq!(snap.synthesis_result.as_deref(), Some(synthesis.as_str()));
        assert!(!snap.is_judging);

        // Completed deliberations refuse another synthesis or round.
        assert!(matches!(
            store.request_judge_synthesis("judge/model").await,
            Err(DeliberationError::InvalidStatus(DeliberationStatus::Completed))
        ));
        assert!(matches!(
            store.start_next_round().await,
            Err(DeliberationError::InvalidStatus(DeliberationStatus::Completed))
        ));
    }

    #[tokio::test]
    async fn test_judge_failure_keeps_deliberating() {
        let adapter = Scripted::new();
        adapter.reply("judge/model", 0, Reply::Fail(ProviderError::Overloaded("Local".to_string())));
        let store = store_with(adapter.clone());
        store.start_deliberation("X", &ids(&["A"])).await.unwrap();
        store.select_all_responses();

        let err = store.request_judge_synthesis("judge/model").await.unwrap_err();
        assert!(matches!(err, DeliberationError::Provider(ProviderError::Overloaded(_))));

        let snap = store.snapshot();
        assert_eq!(snap.status, DeliberationStatus::Deliberating);
        assert!(!snap.is_judging);
        assert!(snap.judge_error.is_some());
        assert!(snap.synthesis_result.is_none());

        adapter.reply("judge/model", 0, Reply::Text("veredito"));
        assert_eq!(store.request_judge_synthesis("judge/model").await.unwrap(), "veredito");
        assert!(store.snapshot().judge_error.is_none());
    }

    #[tokio::test]
    async fn test_judge_requires_selection() {
        let store = store_with(Scripted::new());
        store.start_deliberation("X", &ids(&["A"])).await.unwrap();
        assert!(matches!(
            store.request_judge_synthesis("judge/model").await,
            Err(DeliberationError::EmptySelection)
        ));
    }

    #[tokio::test]
    async fn test_judge_and_round_advance_are_exclusive() {
        let adapter = Scripted::new();
        adapter.reply("judge/model", 100, Reply::Text("veredito"));
        let store = store_with(adapter);
        store.start_deliberation("X", &ids(&["A"])).await.unwrap();
        store.select_all_responses();

        let judging = {
            let store = store.clone();
            tokio::spawn(async move { store.request_judge_synthesis("judge/model").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.snapshot().is_judging);
        assert!(matches!(store.start_next_round().await, Err(DeliberationError::JudgeInFlight)));
        assert!(matches!(
            store.request_judge_synthesis("judge/model").await,
            Err(DeliberationError::JudgeInFlight)
        ));
        assert!(judging.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_start_resets_round_and_selection() {
        let store = store_with(Scripted::new());
        store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();
        store.select_all_responses();
        store.start_next_round().await.unwrap();
        assert_eq!(store.snapshot().round, 2);

        store.start_deliberation("Y", &ids(&["A"])).await.unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.round, 1);
        assert!(snap.selection.is_empty());
        assert_eq!(snap.prompt, "Y");
        assert_eq!(snap.responses.len(), 1);
        assert_eq!(snap.columns.len(), 1);
    }

    #[tokio::test]
    async fn test_start_preconditions() {
        let store = store_with(Scripted::new());
        assert!(matches!(
            store.start_deliberation("   ", &ids(&["A"])).await,
            Err(DeliberationError::EmptyPrompt)
        ));
        assert!(matches!(
            store.start_deliberation("X", &[]).await,
            Err(DeliberationError::NoModelsSelected)
        ));
        assert!(matches!(
            store.start_next_round().await,
            Err(DeliberationError::InvalidStatus(DeliberationStatus::Idle))
        ));
        assert_eq!(store.status(), DeliberationStatus::Idle);
    }

    #[tokio::test]
    async fn test_toggle_error_response_is_noop() {
        let adapter = Scripted::new();
        adapter.reply("A", 0, Reply::Fail(ProviderError::Network("down".to_string())));
        let store = store_with(adapter);
        store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();

        let a1 = response_id(&store, "A", 1);
        assert!(!store.toggle_response_selection(&a1));
        assert!(!store.toggle_response_selection("no-such-id"));
        assert!(store.snapshot().selection.is_empty());

        assert_eq!(store.select_all_responses(), 1);
        assert!(!store.snapshot().selection.contains(&a1));

        let b1 = response_id(&store, "B", 1);
        assert!(!store.toggle_response_selection(&b1));
        assert!(store.toggle_response_selection(&b1));
    }

    #[tokio::test]
    async fn test_select_all_then_clear_is_empty() {
        let store = store_with(Scripted::new());
        store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();
        let b1 = response_id(&store, "B", 1);
        store.toggle_response_selection(&b1);

        store.select_all_responses();
        store.clear_response_selection();
        assert!(store.snapshot().selection.is_empty());

        store.clear_response_selection();
        assert!(store.snapshot().selection.is_empty());
    }

    #[tokio::test]
    async fn test_full_transcript_is_local_and_completes() {
        let adapter = Scripted::new();
        let store = store_with(adapter.clone());
        store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();
        assert!(matches!(
            store.end_with_full_transcript(),
            Err(DeliberationError::EmptySelection)
        ));

        store.select_all_responses();
        let calls_before = adapter.calls().len();
        let document = store.end_with_full_transcript().unwrap();

        assert_eq!(adapter.calls().len(), calls_before);
        assert!(document.starts_with("## Rodada 1"));
        let snap = store.snapshot();
        assert_eq!(snap.status, DeliberationStatus::Completed);
        assert_eq!(snap.full_transcript_result.as_deref(), Some(document.as_str()));

        store.clear_full_transcript();
        let snap = store.snapshot();
        assert!(snap.full_transcript_result.is_none());
        assert_eq!(snap.status, DeliberationStatus::Completed);
    }

    #[tokio::test]
    async fn test_clearing_one_result_keeps_the_other() {
        let adapter = Scripted::new();
        adapter.reply("judge/model", 0, Reply::Text("veredito"));
        let store = store_with(adapter);
        store.start_deliberation("X", &ids(&["A"])).await.unwrap();
        store.select_all_responses();
        store.request_judge_synthesis("judge/model").await.unwrap();
        store.end_with_full_transcript().unwrap();

        store.clear_synthesis();
        let snap = store.snapshot();
        assert!(snap.synthesis_result.is_none());
        assert!(snap.full_transcript_result.is_some());
        assert_eq!(snap.status, DeliberationStatus::Completed);
    }

    #[tokio::test]
    async fn test_all_failed_round_still_deliberating() {
        let adapter = Scripted::new();
        adapter.reply("A", 0, Reply::Fail(ProviderError::MissingCredential("X_KEY".to_string())));
        adapter.reply("B", 0, Reply::Fail(ProviderError::ContextLengthExceeded));
        let store = store_with(adapter.clone());

        let summary = store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();
        assert!(summary.all_failed());
        let snap = store.snapshot();
        assert_eq!(snap.status, DeliberationStatus::Deliberating);
        assert!(snap.last_round_all_failed);
        assert_eq!(snap.column("A")[0].error.as_deref(), Some("X_KEY não configurada"));

        assert!(matches!(store.start_next_round().await, Err(DeliberationError::EmptySelection)));

        adapter.reply("A", 0, Reply::Text("ok"));
        let retry = store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();
        assert_eq!(retry.succeeded, 1);
        assert!(!store.snapshot().last_round_all_failed);
    }

    #[tokio::test]
    async fn test_unknown_model_recorded_as_error() {
        let store = store_with(Scripted::new());
        store.start_deliberation("X", &ids(&["A", "vendor/ghost"])).await.unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.column_status("vendor/ghost"), ColumnStatus::Error);
        assert_eq!(snap.column("vendor/ghost")[0].model_name, "ghost");
    }

    #[tokio::test]
    async fn test_stale_results_discarded_after_restart() {
        let adapter = Scripted::new();
        adapter.reply("A", 150, Reply::Text("old answer"));
        adapter.reply("B", 0, Reply::Text("new answer"));
        let store = store_with(adapter);

        let old = {
            let store = store.clone();
            tokio::spawn(async move { store.start_deliberation("old", &ids(&["A"])).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.start_deliberation("new", &ids(&["B"])).await.unwrap();

        assert!(matches!(old.await.unwrap(), Err(DeliberationError::Superseded)));
        let snap = store.snapshot();
        assert_eq!(snap.prompt, "new");
        assert_eq!(snap.status, DeliberationStatus::Deliberating);
        assert_eq!(snap.responses.len(), 1);
        assert_eq!(snap.responses[0].model_id, "B");
        assert!(!snap.columns.contains_key("A"));
    }

    #[tokio::test]
    async fn test_reset_discards_in_flight_round() {
        let adapter = Scripted::new();
        adapter.reply("A", 100, Reply::Text("late"));
        let store = store_with(adapter);

        let running = {
            let store = store.clone();
            tokio::spawn(async move { store.start_deliberation("X", &ids(&["A"])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.reset();

        assert!(matches!(running.await.unwrap(), Err(DeliberationError::Superseded)));
        assert_eq!(store.snapshot(), DeliberationSnapshot::default());
    }

    #[tokio::test]
    async fn test_session_gate_blocks_calls() {
        let adapter = Scripted::new();
        let store = store_with(adapter.clone());
        let gate = Arc::new(Gate(AtomicBool::new(false)));
        store.set_session_gate(gate.clone());

        assert!(matches!(
            store.start_deliberation("X", &ids(&["A"])).await,
            Err(DeliberationError::AuthRequired)
        ));
        assert!(store.snapshot().auth_required);
        assert!(adapter.calls().is_empty());

        gate.0.store(true, Ordering::SeqCst);
        store.start_deliberation("X", &ids(&["A"])).await.unwrap();
        assert!(!store.snapshot().auth_required);
    }

    /// Session that expires on demand and renews itself when asked.
    struct Renewable {
        valid: AtomicBool,
        renewals: AtomicUsize,
    }

    #[async_trait]
    impl SessionGate for Renewable {
        fn is_session_valid(&self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        async fn ensure_valid(&self) -> bool {
            if !self.is_session_valid() {
                self.renewals.fetch_add(1, Ordering::SeqCst);
                self.valid.store(true, Ordering::SeqCst);
            }
            true
        }
    }

    #[tokio::test]
    async fn test_expired_session_renewed_before_next_round_and_judge() {
        let adapter = Scripted::new();
        adapter.reply("judge/model", 0, Reply::Text("veredito"));
        let store = store_with(adapter.clone());
        let gate = Arc::new(Renewable {
            valid: AtomicBool::new(true),
            renewals: AtomicUsize::new(0),
        });
        store.set_session_gate(gate.clone());

        store.start_deliberation("X", &ids(&["A"])).await.unwrap();
        store.select_all_responses();

        gate.valid.store(false, Ordering::SeqCst);
        store.start_next_round().await.unwrap();
        assert_eq!(gate.renewals.load(Ordering::SeqCst), 1);

        store.select_all_responses();
        gate.valid.store(false, Ordering::SeqCst);
        store.request_judge_synthesis("judge/model").await.unwrap();
        assert_eq!(gate.renewals.load(Ordering::SeqCst), 2);

        let snap = store.snapshot();
        assert!(!snap.auth_required);
        assert_eq!(snap.status, DeliberationStatus::Completed);
        assert_eq!(adapter.calls_to("A").len(), 2);
    }

    #[tokio::test]
    async fn test_events_follow_each_column() {
        let adapter = Scripted::new();
        adapter.reply("A", 30, Reply::Text("a"));
        adapter.reply("B", 0, Reply::Text("b"));
        let store = store_with(adapter);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.subscribe(Arc::new(move |event| sink.lock().unwrap().push(event)));

        store.start_deliberation("X", &ids(&["A", "B"])).await.unwrap();

        let events = events.lock().unwrap();
        let updated: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                DeliberationEvent::ColumnUpdated { model_id, .. } => Some(model_id.as_str()),
                _ => None,
            })
            .collect();
        // Columns resolve in completion order, not request order.
        assert_eq!(updated, vec!["B", "A"]);
        assert!(matches!(events.first(), Some(DeliberationEvent::RoundStarted { round: 1, .. })));
        assert!(matches!(events.last(), Some(DeliberationEvent::RoundSettled(_))));
    }

    #[tokio::test]
    async fn test_export_markdown_from_store() {
        let adapter = Scripted::new();
        adapter.reply("judge/model", 0, Reply::Text("veredito"));
        let store = store_with(adapter);
        store.start_deliberation("X", &ids(&["A"])).await.unwrap();
        store.select_all_responses();
        store.end_with_full_transcript().unwrap();

        let without = store.export_markdown(false);
        assert!(without.starts_with("# Deliberação Assistida por LLMs"));
        assert!(!without.contains("## Transcrição Integral"));
        assert!(store.export_markdown(true).contains("## Transcrição Integral"));
    }
}
