//! LLM dispatch + fallback ladder (spec §4.5/C5), grounded in the teacher's
//! `agent/execution/llm_retry.rs` retry loop (cancellable exponential-backoff
//! wait, rate-limit event pair) generalized from "rate-limit retry only" to
//! the full same-provider → cross-provider fallback ladder the spec calls
//! for. One generic routine parameterized by `ErrorKind`, rather than a
//! duplicated block per kind, per the REDESIGN FLAGS.

use super::{infer_provider, GenerateOptions, LLMAdapter, Response};
use crate::error::{ErrorKind, LLMError};
use crate::message::Conversation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Which rung of the fallback ladder an attempt belongs to (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPhase {
    SameProvider,
    CrossProvider,
    ThrottleRetryPrimary,
}

/// Observes dispatch decisions without coupling `relay-core` to the event-bus
/// crate. `relay-agent` implements this to bridge attempts into `Event`s.
pub trait DispatchObserver: Send + Sync {
    fn fallback_attempt(
        &self,
        _phase: FallbackPhase,
        _index: usize,
        _model: &str,
        _success: bool,
        _duration: Duration,
        _error: Option<&str>,
    ) {
    }
    fn model_change(&self, _old_model: &str, _new_model: &str) {}
    fn throttling_wait(&self, _attempt: usize, _wait: Duration) {}
    fn all_fallbacks_failed(&self, _attempts: usize) {}
}

/// No-op observer for callers that don't need decision-trail visibility.
pub struct NoopObserver;
impl DispatchObserver for NoopObserver {}

/// Static fallback configuration (spec §4.5).
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Additional model ids to try on the primary's own provider, in order.
    pub same_provider_models: Vec<String>,
    /// Model ids to try on other providers, in order. Provider is inferred
    /// per id via `infer_provider` unless overridden by caller config.
    pub cross_provider_models: Vec<String>,
    pub max_attempts: usize,
    pub throttle_base_wait: Duration,
    pub throttle_backoff_multiplier: f64,
    pub throttle_max_wait: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            same_provider_models: Vec::new(),
            cross_provider_models: Vec::new(),
            max_attempts: 5,
            throttle_base_wait: Duration::from_secs(2),
            throttle_backoff_multiplier: 2.0,
            throttle_max_wait: Duration::from_secs(300),
        }
    }
}

struct DispatchState {
    provider: String,
    model: String,
}

/// Owns the single mutable "current primary model/provider" state the spec
/// calls for (§9: "single-owner state machine held inside the dispatcher"),
/// rather than fields mutated directly on some wider agent struct.
pub struct Dispatcher {
    adapters: HashMap<String, Arc<dyn LLMAdapter>>,
    state: Mutex<DispatchState>,
    fallback: FallbackConfig,
    observer: Arc<dyn DispatchObserver>,
}

impl Dispatcher {
    pub fn new(
        adapters: HashMap<String, Arc<dyn LLMAdapter>>,
        primary_provider: impl Into<String>,
        primary_model: impl Into<String>,
        fallback: FallbackConfig,
        observer: Arc<dyn DispatchObserver>,
    ) -> Self {
        Self {
            adapters,
            state: Mutex::new(DispatchState {
                provider: primary_provider.into(),
                model: primary_model.into(),
            }),
            fallback,
            observer,
        }
    }

    /// The model id currently bound as primary. Reflects any prior permanent
    /// fallback promotion (spec's fallback-monotonicity invariant).
    pub fn current_model(&self) -> String {
        self.state.lock().model.clone()
    }

    pub fn current_provider(&self) -> String {
        self.state.lock().provider.clone()
    }

    fn adapter_for(&self, provider: &str) -> Option<Arc<dyn LLMAdapter>> {
        self.adapters.get(provider).cloned()
    }

    /// Runs one LLM call with the full fallback ladder (spec §4.5). Returns
    /// the successful response, or the last classified error once every rung
    /// (and the hard attempt cap) is exhausted.
    pub async fn generate_with_retry(
        &self,
        conversation: &Conversation,
        base_options: &GenerateOptions,
        cancel_token: &CancellationToken,
    ) -> Result<Response, LLMError> {
        let (provider, model) = {
            let state = self.state.lock();
            (state.provider.clone(), state.model.clone())
        };

        let Some(primary_adapter) = self.adapter_for(&provider) else {
            return Err(LLMError::InvalidRequest(format!(
                "no adapter registered for provider '{provider}'"
            )));
        };

        let mut attempts = 0usize;
        let mut options = base_options.clone();
        options.model = model.clone();

        match self.try_call(&primary_adapter, conversation, &options, cancel_token).await {
            Ok(resp) => return Ok(resp),
            Err(err) => {
                let kind = ErrorKind::classify(&err);
                if !kind.triggers_fallback() {
                    return Err(err);
                }
                self.run_ladder(
                    conversation,
                    &options,
                    cancel_token,
                    &provider,
                    &model,
                    kind,
                    err,
                    &mut attempts,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_ladder(
        &self,
        conversation: &Conversation,
        base_options: &GenerateOptions,
        cancel_token: &CancellationToken,
        primary_provider: &str,
        primary_model: &str,
        mut last_kind: ErrorKind,
        mut last_err: LLMError,
        attempts: &mut usize,
    ) -> Result<Response, LLMError> {
        loop {
            // Phase 1: same-provider fallbacks.
            if let Some(adapter) = self.adapter_for(primary_provider) {
                for (idx, model) in self.fallback.same_provider_models.iter().enumerate() {
                    if model == primary_model {
                        continue;
                    }
                    if let Some(resp) = self
                        .attempt_rung(
                            FallbackPhase::SameProvider,
                            idx,
                            &adapter,
                            primary_provider,
                            model,
                            conversation,
                            base_options,
                            cancel_token,
                            attempts,
                        )
                        .await?
                    {
                        return Ok(resp);
                    }
                }
            }

            // Phase 2: cross-provider fallbacks.
            for (idx, model) in self.fallback.cross_provider_models.iter().enumerate() {
                let provider = infer_provider(model);
                let Some(adapter) = self.adapter_for(provider) else {
                    continue;
                };
                if let Some(resp) = self
                    .attempt_rung(
                        FallbackPhase::CrossProvider,
                        idx,
                        &adapter,
                        provider,
                        model,
                        conversation,
                        base_options,
                        cancel_token,
                        attempts,
                    )
                    .await?
                {
                    return Ok(resp);
                }
            }

            if last_kind != ErrorKind::Throttling || *attempts >= self.fallback.max_attempts {
                self.observer.all_fallbacks_failed(*attempts);
                return Err(last_err);
            }

            // Throttling-only: wait with capped exponential backoff, then
            // retry the primary model once more.
            let wait = Duration::from_secs_f64(
                (self.fallback.throttle_base_wait.as_secs_f64()
                    * self.fallback.throttle_backoff_multiplier.powi(*attempts as i32))
                .min(self.fallback.throttle_max_wait.as_secs_f64()),
            );
            self.observer.throttling_wait(*attempts, wait);
            if wait_with_cancellation(wait, cancel_token).await {
                return Err(LLMError::Cancelled);
            }

            *attempts += 1;
            if *attempts >= self.fallback.max_attempts {
                self.observer.all_fallbacks_failed(*attempts);
                return Err(last_err);
            }

            let Some(adapter) = self.adapter_for(primary_provider) else {
                return Err(last_err);
            };
            let mut options = base_options.clone();
            options.model = primary_model.to_string();
            let started = Instant::now();
            match self.try_call(&adapter, conversation, &options, cancel_token).await {
                Ok(resp) => {
                    self.observer.fallback_attempt(
                        FallbackPhase::ThrottleRetryPrimary,
                        *attempts,
                        primary_model,
                        true,
                        started.elapsed(),
                        None,
                    );
                    return Ok(resp);
                }
                Err(err) => {
                    self.observer.fallback_attempt(
                        FallbackPhase::ThrottleRetryPrimary,
                        *attempts,
                        primary_model,
                        false,
                        started.elapsed(),
                        Some(&err.to_string()),
                    );
                    last_kind = ErrorKind::classify(&err);
                    last_err = err;
                    if !last_kind.triggers_fallback() {
                        return Err(last_err);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_rung(
        &self,
        phase: FallbackPhase,
        index: usize,
        adapter: &Arc<dyn LLMAdapter>,
        provider: &str,
        model: &str,
        conversation: &Conversation,
        base_options: &GenerateOptions,
        cancel_token: &CancellationToken,
        attempts: &mut usize,
    ) -> Result<Option<Response>, LLMError> {
        if *attempts >= self.fallback.max_attempts {
            return Ok(None);
        }
        if cancel_token.is_cancelled() {
            return Err(LLMError::Cancelled);
        }
        *attempts += 1;

        let mut options = base_options.clone();
        options.model = model.to_string();
        let started = Instant::now();
        match self.try_call(adapter, conversation, &options, cancel_token).await {
            Ok(resp) => {
                self.observer.fallback_attempt(
                    phase,
                    index,
                    model,
                    true,
                    started.elapsed(),
                    None,
                );
                let (old_provider, old_model) = {
                    let mut state = self.state.lock();
                    let old = (state.provider.clone(), state.model.clone());
                    state.provider = provider.to_string();
                    state.model = model.to_string();
                    old
                };
                if old_model != model {
                    self.observer.model_change(&old_model, model);
                }
                let _ = old_provider;
                Ok(Some(resp))
            }
            Err(err) => {
                self.observer.fallback_attempt(
                    phase,
                    index,
                    model,
                    false,
                    started.elapsed(),
                    Some(&err.to_string()),
                );
                Ok(None)
            }
        }
    }

    async fn try_call(
        &self,
        adapter: &Arc<dyn LLMAdapter>,
        conversation: &Conversation,
        options: &GenerateOptions,
        cancel_token: &CancellationToken,
    ) -> Result<Response, LLMError> {
        if cancel_token.is_cancelled() {
            return Err(LLMError::Cancelled);
        }
        tokio::select! {
            result = adapter.generate_content(conversation, options) => result,
            _ = cancel_token.cancelled() => Err(LLMError::Cancelled),
        }
    }
}

async fn wait_with_cancellation(wait: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        _ = cancel_token.cancelled() => true,
    }
}
