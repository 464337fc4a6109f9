//! Dispatch orchestration.
//!
//! One call per inbound message: classify, resolve the requested model,
//! check credentials, load bounded history, invoke the backend and persist
//! the exchange, walking the failover chain when a backend is degraded.
//! The user turn is persisted eagerly, immediately after the history load
//! and before the first backend attempt, and exactly once regardless of how
//! many attempts follow. Dispatches for different users run concurrently;
//! the memory store's lock is held only inside its read-modify-write cycle,
//! never across a backend call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tokio::task::spawn_blocking;

use crate::credentials::CredentialStore;
use crate::errors::{BackendError, BackendFault, DispatchError, StorageError};
use crate::logging::log_event;
use crate::memory::{ConversationMemory, Turn};
use crate::providers::adapters::ChatBackend;
use crate::providers::registry::{self, ProviderProfile};
use crate::store::{DbPool, RecordStore};
use crate::triage::{TriageClassifier, TriageResult};

/// Successful dispatch, ready for serialization at the API boundary.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub reply: String,
    pub provider_id: String,
    pub model: String,
    pub elapsed_ms: u64,
    pub history_length: usize,
    /// Routing signal for the caller; the dispatcher itself never acts on it.
    pub triage: TriageResult,
}

struct DispatchPlan {
    primary: ProviderProfile,
    fallbacks: Vec<ProviderProfile>,
    timeout: Duration,
    max_turns: usize,
}

pub struct Dispatcher {
    pool: DbPool,
    memory: ConversationMemory,
    credentials: CredentialStore,
    classifier: TriageClassifier,
    backend: Arc<dyn ChatBackend>,
}

impl Dispatcher {
    pub fn new(
        pool: DbPool,
        records: Arc<dyn RecordStore>,
        backend: Arc<dyn ChatBackend>,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            pool,
            memory: ConversationMemory::new(records.clone()),
            credentials: CredentialStore::new(records),
            classifier: TriageClassifier::with_default_lexicon()?,
            backend,
        }))
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub async fn dispatch(
        &self,
        user_id: &str,
        message: &str,
        requested_model: &str,
        session_id: Option<&str>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        let triage = self.classifier.classify(message);

        // Resolve the requested profile, the failover candidates and the
        // runtime tunables in one trip to the database.
        let plan = {
            let pool = self.pool.clone();
            let requested = requested_model.to_string();
            spawn_blocking(move || -> anyhow::Result<DispatchPlan> {
                let conn = pool.get()?;
                let primary = registry::resolve(&conn, &requested)?;
                let mut fallbacks = Vec::new();
                for key in registry::failover_chain(&conn)? {
                    if primary.key.as_deref() == Some(key.as_str()) {
                        continue;
                    }
                    let profile = registry::resolve(&conn, &key)?;
                    if profile.provider.id == primary.provider.id && profile.model == primary.model
                    {
                        continue;
                    }
                    fallbacks.push(profile);
                }
                Ok(DispatchPlan {
                    primary,
                    fallbacks,
                    timeout: registry::backend_timeout(&conn)?,
                    max_turns: registry::history_limit(&conn)?,
                })
            })
            .await
            .map_err(join_error)?
            .map_err(|err| DispatchError::Storage(err.to_string()))?
        };
        let timeout = plan.timeout;
        let max_turns = plan.max_turns;

        // Credential for the requested profile: absence is terminal, never
        // retried, and surfaces before any history write. Chain entries
        // without a stored key are skipped: a missing key is configuration,
        // not a transient fault.
        let attempts = {
            let credentials = self.credentials.clone();
            let user = user_id.to_string();
            spawn_blocking(move || -> Result<Vec<(ProviderProfile, Option<String>)>, DispatchError> {
                let mut attempts = Vec::new();
                let primary_credential = if plan.primary.requires_credential() {
                    match credentials.get(&user, &plan.primary.provider.id)? {
                        Some(secret) => Some(secret),
                        None => {
                            return Err(DispatchError::MissingCredential {
                                provider: plan.primary.provider.id.clone(),
                                setup_url: plan.primary.provider.setup_url.clone(),
                            })
                        }
                    }
                } else {
                    None
                };
                attempts.push((plan.primary, primary_credential));
                for profile in plan.fallbacks {
                    if profile.requires_credential() {
                        match credentials.get(&user, &profile.provider.id)? {
                            Some(secret) => attempts.push((profile, Some(secret))),
                            None => continue,
                        }
                    } else {
                        attempts.push((profile, None));
                    }
                }
                Ok(attempts)
            })
            .await
            .map_err(join_error)??
        };

        // Bounded history for the backend call, then the eager user turn.
        let history = {
            let memory = self.memory.clone();
            let user = user_id.to_string();
            let session = session_id.map(str::to_string);
            let text = message.to_string();
            spawn_blocking(move || -> Result<Vec<Turn>, StorageError> {
                let history = memory.load_history(&user, session.as_deref())?;
                memory.append_entry(&user, "user", &text, session.as_deref(), max_turns)?;
                Ok(history)
            })
            .await
            .map_err(join_error)?
            .map_err(DispatchError::from)?
        };

        let mut last_err: Option<BackendError> = None;
        for (profile, credential) in attempts {
            match self
                .backend
                .invoke(&profile, message, &history, credential.as_deref(), timeout)
                .await
            {
                Ok(reply) => {
                    let history_length = {
                        let memory = self.memory.clone();
                        let user = user_id.to_string();
                        let session = session_id.map(str::to_string);
                        let text = reply.clone();
                        spawn_blocking(move || {
                            memory.append_entry(&user, "assistant", &text, session.as_deref(), max_turns)
                        })
                        .await
                        .map_err(join_error)?
                        .map_err(DispatchError::from)?
                    };
                    self.log_invocation_success(&profile, &reply);
                    return Ok(DispatchOutcome {
                        reply,
                        provider_id: profile.provider.id,
                        model: profile.model,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        history_length,
                        triage,
                    });
                }
                Err(err) => {
                    self.log_invocation_failure(&profile, &err);
                    last_err = Some(err);
                }
            }
        }

        Err(DispatchError::Backend(last_err.unwrap_or_else(|| {
            BackendError::new("none", BackendFault::Transport, "no backend available")
        })))
    }

    fn log_invocation_success(&self, profile: &ProviderProfile, reply: &str) {
        let preview: String = reply.chars().take(200).collect();
        let pool = self.pool.clone();
        let provider = profile.provider.id.clone();
        let model = profile.model.clone();
        tokio::spawn(async move {
            if let Ok(conn) = pool.get() {
                let _ = log_event(
                    &conn,
                    "info",
                    Some("AI-0200"),
                    "ai.dispatch",
                    "backend invocation succeeded",
                    Some("Dispatcher resolved a provider"),
                    Some(json!({
                        "provider": provider,
                        "model": model,
                        "preview": preview,
                    })),
                );
            }
        });
    }

    fn log_invocation_failure(&self, profile: &ProviderProfile, error: &BackendError) {
        log::warn!(
            "backend {} failed for model {}: {}",
            profile.provider.id,
            profile.model,
            error
        );
        let pool = self.pool.clone();
        let provider = profile.provider.id.clone();
        let model = profile.model.clone();
        let message = error.to_string();
        tokio::spawn(async move {
            if let Ok(conn) = pool.get() {
                let _ = log_event(
                    &conn,
                    "warn",
                    Some("AI-0201"),
                    "ai.dispatch",
                    "backend invocation failed",
                    Some("Attempting failover"),
                    Some(json!({
                        "provider": provider,
                        "model": model,
                        "error": message,
                    })),
                );
            }
        });
    }
}

fn join_error(err: tokio::task::JoinError) -> DispatchError {
    DispatchError::Storage(format!("blocking task failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::registry::put_setting;
    use crate::store::{test_pool, SqliteRecords};
    use crate::triage::TriageLevel;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<String, &'static str>>>,
        calls: Mutex<Vec<(String, String, Option<String>)>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<String, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn invoke(
            &self,
            profile: &ProviderProfile,
            _message: &str,
            _history: &[Turn],
            credential: Option<&str>,
            _timeout: Duration,
        ) -> Result<String, BackendError> {
            self.calls.lock().unwrap().push((
                profile.provider.id.clone(),
                profile.model.clone(),
                credential.map(str::to_string),
            ));
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(detail)) => Err(BackendError::new(
                    &profile.provider.id,
                    BackendFault::Transport,
                    detail,
                )),
                None => Err(BackendError::new(
                    &profile.provider.id,
                    BackendFault::Transport,
                    "script exhausted",
                )),
            }
        }
    }

    fn dispatcher_with(
        script: Vec<Result<String, &'static str>>,
    ) -> (Arc<Dispatcher>, Arc<ScriptedBackend>, DbPool) {
        let pool = test_pool();
        let records = SqliteRecords::new(pool.clone());
        let backend = ScriptedBackend::new(script);
        let dispatcher = Dispatcher::new(pool.clone(), records, backend.clone()).unwrap();
        (dispatcher, backend, pool)
    }

    #[tokio::test]
    async fn missing_credential_is_terminal_and_writes_no_turns() {
        let (dispatcher, backend, _pool) = dispatcher_with(vec![Ok("never sent".into())]);

        let err = dispatcher
            .dispatch("alice", "hello there", "gpt-4", None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "MISSING_CREDENTIAL");
        assert_eq!(err.setup_hint(), Some("https://platform.openai.com/"));
        assert!(backend.calls().is_empty());
        assert!(dispatcher.memory().load_history("alice", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_success_records_both_turns_in_order() {
        let (dispatcher, backend, _pool) = dispatcher_with(vec![Ok("hi bob!".into())]);

        let outcome = dispatcher
            .dispatch("bob", "hello", "ollama-llama3", None)
            .await
            .unwrap();

        assert_eq!(outcome.provider_id, "ollama");
        assert_eq!(outcome.model, "ollama-llama3");
        assert_eq!(outcome.reply, "hi bob!");
        assert_eq!(outcome.history_length, 2);
        assert_eq!(outcome.triage.level, TriageLevel::Stable);

        let history = dispatcher.memory().load_history("bob", None).unwrap();
        assert_eq!(
            history,
            vec![Turn::new("user", "hello"), Turn::new("assistant", "hi bob!")]
        );
        // the local backend gets no credential
        assert_eq!(backend.calls()[0].2, None);
    }

    #[tokio::test]
    async fn cloud_dispatch_hands_the_stored_credential_to_the_adapter() {
        let (dispatcher, backend, _pool) = dispatcher_with(vec![Ok("cloud reply".into())]);
        dispatcher.credentials().set("bob", "openai", "sk-test").unwrap();

        let outcome = dispatcher
            .dispatch("bob", "hello cloud", "gpt-4o", None)
            .await
            .unwrap();

        assert_eq!(outcome.provider_id, "openai");
        assert_eq!(backend.calls()[0].2.as_deref(), Some("sk-test"));
    }

    #[tokio::test]
    async fn failover_exhaustion_surfaces_one_backend_error_and_only_the_user_turn() {
        let (dispatcher, backend, _pool) =
            dispatcher_with(vec![Err("down"), Err("down"), Err("down")]);

        let err = dispatcher
            .dispatch("carol", "please answer", "balanced", None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "BACKEND_ERROR");
        // requested profile plus the two remaining chain entries
        let models: Vec<String> = backend.calls().into_iter().map(|(_, m, _)| m).collect();
        assert_eq!(models, vec!["deepseek-r1:7b", "gemma:2b", "llama3"]);

        // eager policy: exactly one user turn, zero assistant turns
        let history = dispatcher.memory().load_history("carol", None).unwrap();
        assert_eq!(history, vec![Turn::new("user", "please answer")]);
    }

    #[tokio::test]
    async fn failover_recovers_on_a_later_profile_without_duplicating_turns() {
        let (dispatcher, _backend, _pool) =
            dispatcher_with(vec![Err("down"), Ok("recovered".into())]);

        let outcome = dispatcher
            .dispatch("dave", "still there?", "balanced", None)
            .await
            .unwrap();

        assert_eq!(outcome.provider_id, "ollama");
        assert_eq!(outcome.model, "gemma:2b");

        let history = dispatcher.memory().load_history("dave", None).unwrap();
        assert_eq!(
            history,
            vec![
                Turn::new("user", "still there?"),
                Turn::new("assistant", "recovered"),
            ]
        );
    }

    #[tokio::test]
    async fn chain_entries_without_credentials_are_skipped() {
        let (dispatcher, backend, pool) = dispatcher_with(vec![Err("down"), Ok("fast wins".into())]);
        {
            let conn = pool.get().unwrap();
            put_setting(&conn, "dispatch.failover_chain", r#"["deepseek", "fast"]"#).unwrap();
        }

        let outcome = dispatcher
            .dispatch("erin", "route me", "balanced", None)
            .await
            .unwrap();

        assert_eq!(outcome.model, "gemma:2b");
        let providers: Vec<String> = backend.calls().into_iter().map(|(p, _, _)| p).collect();
        // the deepseek chain entry has no stored key and is never attempted
        assert_eq!(providers, vec!["ollama", "ollama"]);
    }

    #[tokio::test]
    async fn triage_metadata_passes_through_without_changing_routing() {
        let (dispatcher, backend, _pool) = dispatcher_with(vec![Ok("acknowledged".into())]);

        let outcome = dispatcher
            .dispatch("frank", "ALARM", "ollama-llama3", None)
            .await
            .unwrap();

        assert_eq!(outcome.triage.level, TriageLevel::Panic);
        assert_eq!(outcome.triage.intensity, 10);
        assert_eq!(outcome.triage.indicators, vec!["CODE_ALARM".to_string()]);
        // routing is unaffected by the classification
        assert_eq!(backend.calls()[0].0, "ollama");
    }

    #[tokio::test]
    async fn session_scoping_keeps_parallel_sessions_apart() {
        let (dispatcher, _backend, _pool) =
            dispatcher_with(vec![Ok("one".into()), Ok("two".into())]);

        dispatcher
            .dispatch("gail", "first", "ollama-llama3", None)
            .await
            .unwrap();
        dispatcher
            .dispatch("gail", "second", "ollama-llama3", Some("work"))
            .await
            .unwrap();

        assert_eq!(dispatcher.memory().load_history("gail", None).unwrap().len(), 2);
        let work = dispatcher.memory().load_history("gail", Some("work")).unwrap();
        assert_eq!(work[0].content, "second");
    }
}
