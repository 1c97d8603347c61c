//! Isolated-world bridge between one tab and the consent script.
//!
//! Every frame gets its own execution context under a shared world name. The
//! consent script is injected into each of those contexts and talks back
//! through a single named binding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::protocol::{Diagnostic, ProtocolEvent, ProtocolSession};

pub const DEFAULT_WORLD_NAME: &str = "consent-audit";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub world_name: String,
    pub binding_name: String,
    /// Source evaluated in every new context of `world_name`.
    pub script: Arc<str>,
}

impl BridgeConfig {
    /// Config with a fresh random binding name for one session.
    pub fn new(script: impl Into<Arc<str>>) -> Self {
        Self {
            world_name: DEFAULT_WORLD_NAME.to_string(),
            binding_name: random_binding_name(),
            script: script.into(),
        }
    }
}

fn random_binding_name() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("cdpBinding_{token}")
}

/// Receives parsed binding messages, one at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Value, context_id: String);
}

#[derive(Debug, Default)]
struct BridgeState {
    exec_to_unique: HashMap<i64, String>,
    unique_to_exec: HashMap<String, i64>,
    frame_of_context: HashMap<String, String>,
    default_world_by_frame: HashMap<String, String>,
    isolated: Vec<String>,
    errors: Vec<String>,
}

pub struct Bridge<S> {
    session: Arc<S>,
    config: Arc<BridgeConfig>,
    state: Arc<Mutex<BridgeState>>,
}

impl<S> Clone for Bridge<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: ProtocolSession> Bridge<S> {
    pub fn new(session: Arc<S>, config: BridgeConfig) -> Self {
        Self {
            session,
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BridgeState::default())),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn record(&self, diagnostic: Diagnostic) {
        log::debug!("bridge: {diagnostic}");
        if let Ok(mut state) = self.state.lock() {
            state.errors.push(diagnostic.to_string());
        }
    }

    /// Register the session binding for the bridge's world.
    pub async fn add_binding(&self) {
        if let Err(e) = self
            .session
            .add_binding(&self.config.binding_name, &self.config.world_name)
            .await
        {
            self.record(e);
        }
    }

    /// Request one isolated world per frame. Returns how many were created.
    pub async fn create_contexts_for_all_frames(&self) -> usize {
        let frames = match self.session.frame_ids().await {
            Ok(frames) => frames,
            Err(e) => {
                self.record(e);
                return 0;
            }
        };
        let results = join_all(frames.iter().map(|frame| {
            self.session
                .create_isolated_world(frame, &self.config.world_name)
        }))
        .await;

        let mut created = 0;
        for (frame, result) in frames.iter().zip(results) {
            match result {
                Ok(()) => created += 1,
                Err(e) => {
                    log::warn!("isolated world for frame {frame} failed: {e}");
                    self.record(e);
                }
            }
        }
        created
    }

    /// Start pumping protocol events into `handler`. Events emitted before
    /// this call returns are not observed.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        handler: Arc<H>,
    ) -> Result<JoinHandle<()>, Diagnostic> {
        let mut events = self.session.events().await?;
        let bridge = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                bridge.dispatch(event, handler.as_ref()).await;
            }
            log::debug!("bridge event stream closed");
        }))
    }

    async fn dispatch<H: MessageHandler>(&self, event: ProtocolEvent, handler: &H) {
        match event {
            ProtocolEvent::ContextCreated {
                id,
                unique_id,
                name,
                frame_id,
                is_default,
            } => {
                let ours = name == self.config.world_name;
                if let Ok(mut state) = self.state.lock() {
                    state.exec_to_unique.insert(id, unique_id.clone());
                    state.unique_to_exec.insert(unique_id.clone(), id);
                    if let Some(frame) = frame_id {
                        if is_default {
                            state
                                .default_world_by_frame
                                .insert(frame.clone(), unique_id.clone());
                        }
                        state.frame_of_context.insert(unique_id.clone(), frame);
                    }
                    if ours {
                        state.isolated.push(unique_id.clone());
                    }
                }
                if ours {
                    let script = Arc::clone(&self.config.script);
                    self.evaluate_in_context(&unique_id, &script).await;
                }
            }
            ProtocolEvent::BindingCalled {
                name,
                payload,
                execution_context_id,
            } => {
                if name != self.config.binding_name {
                    return;
                }
                let context = self
                    .state
                    .lock()
                    .ok()
                    .and_then(|s| s.exec_to_unique.get(&execution_context_id).cloned());
                let Some(context) = context else {
                    self.record(Diagnostic::UnknownContext(execution_context_id.to_string()));
                    return;
                };
                match serde_json::from_str::<Value>(&payload) {
                    Ok(message) => handler.handle(message, context).await,
                    Err(e) => self.record(Diagnostic::Payload(e.to_string())),
                }
            }
        }
    }

    /// Fire-and-forget evaluation; failures are recorded.
    pub async fn evaluate_in_context(&self, context_id: &str, expression: &str) {
        if let Err(e) = self.session.evaluate(context_id, expression, false).await {
            self.record(e);
        }
    }

    /// Evaluate in the default world of the frame that owns
    /// `isolated_context_id`. Only the truthiness of the result survives.
    pub async fn evaluate_in_default_world(
        &self,
        isolated_context_id: &str,
        expression: &str,
    ) -> bool {
        let target = self.state.lock().ok().and_then(|s| {
            let frame = s.frame_of_context.get(isolated_context_id)?;
            s.default_world_by_frame.get(frame).cloned()
        });
        let Some(target) = target else {
            self.record(Diagnostic::UnknownContext(isolated_context_id.to_string()));
            return false;
        };
        match self.session.evaluate(&target, expression, true).await {
            Ok(value) => value.as_ref().is_some_and(truthy),
            Err(e) => {
                self.record(e);
                false
            }
        }
    }

    pub async fn evaluate_for_value(
        &self,
        context_id: &str,
        expression: &str,
    ) -> Result<Value, Diagnostic> {
        self.session
            .evaluate(context_id, expression, true)
            .await
            .map(Option::unwrap_or_default)
    }

    /// Unique ids of every context created in the bridge's world so far.
    pub fn isolated_contexts(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.isolated.clone())
            .unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.errors.clone())
            .unwrap_or_default()
    }
}

/// JavaScript truthiness of a by-value result.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Value, String)>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: Value, context_id: String) {
            self.seen.lock().unwrap().push((message, context_id));
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            world_name: "audit-world".to_string(),
            binding_name: "sendOut".to_string(),
            script: Arc::from("/* consent script */"),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn binding_names_are_random_per_session() {
        let a = BridgeConfig::new("x");
        let b = BridgeConfig::new("x");
        assert!(a.binding_name.starts_with("cdpBinding_"));
        assert_ne!(a.binding_name, b.binding_name);
        assert_eq!(a.world_name, DEFAULT_WORLD_NAME);
    }

    #[test]
    fn truthiness_follows_javascript() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(false)));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!({})));
    }

    #[tokio::test]
    async fn failed_frame_does_not_block_the_others() {
        let session = Arc::new(FakeSession::new(&["f1", "f2", "f3"]).failing("f2"));
        let bridge = Bridge::new(Arc::clone(&session), config());
        let handler = Arc::new(Recorder::default());
        let pump = bridge.subscribe(Arc::clone(&handler)).await.unwrap();

        assert_eq!(bridge.create_contexts_for_all_frames().await, 2);
        settle().await;

        session.send("sendOut", "iso-f1", json!({"type": "init"}));
        session.send("sendOut", "iso-f3", json!({"type": "init"}));
        settle().await;

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, "iso-f1");
        assert_eq!(seen[1].1, "iso-f3");
        assert_eq!(bridge.isolated_contexts(), vec!["iso-f1", "iso-f3"]);
        assert_eq!(bridge.errors().len(), 1);
        assert!(bridge.errors()[0].contains("f2"));
        pump.abort();
    }

    #[tokio::test]
    async fn script_is_injected_only_into_the_bridge_world() {
        let session = Arc::new(FakeSession::new(&["f1"]));
        let bridge = Bridge::new(Arc::clone(&session), config());
        let pump = bridge
            .subscribe(Arc::new(Recorder::default()))
            .await
            .unwrap();

        session.open_default_context("f1");
        session.open_context("other", "some-extension", "f1", false);
        bridge.create_contexts_for_all_frames().await;
        settle().await;

        let evaluated = session.evaluated();
        assert_eq!(evaluated.len(), 1);
        assert_eq!(evaluated[0].0, "iso-f1");
        assert_eq!(evaluated[0].1, "/* consent script */");
        pump.abort();
    }

    #[tokio::test]
    async fn foreign_bindings_and_bad_payloads_are_ignored() {
        let session = Arc::new(FakeSession::new(&["f1"]));
        let bridge = Bridge::new(Arc::clone(&session), config());
        let handler = Arc::new(Recorder::default());
        let pump = bridge.subscribe(Arc::clone(&handler)).await.unwrap();
        bridge.create_contexts_for_all_frames().await;
        settle().await;

        session.send("somebodyElse", "iso-f1", json!({"type": "init"}));
        session.emit(ProtocolEvent::BindingCalled {
            name: "sendOut".to_string(),
            payload: "{not json".to_string(),
            execution_context_id: session.raw_id("iso-f1").unwrap(),
        });
        session.emit(ProtocolEvent::BindingCalled {
            name: "sendOut".to_string(),
            payload: "{}".to_string(),
            execution_context_id: 999,
        });
        settle().await;

        assert!(handler.seen.lock().unwrap().is_empty());
        let errors = bridge.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("invalid binding payload"));
        assert!(errors[1].contains("999"));
        pump.abort();
    }

    #[tokio::test]
    async fn binding_before_its_context_is_dropped_not_misrouted() {
        let session = Arc::new(FakeSession::new(&[]));
        let bridge = Bridge::new(Arc::clone(&session), config());
        let handler = Arc::new(Recorder::default());
        let pump = bridge.subscribe(Arc::clone(&handler)).await.unwrap();

        // first context opened by the fake gets raw id 1
        session.emit(ProtocolEvent::BindingCalled {
            name: "sendOut".to_string(),
            payload: json!({"type": "init"}).to_string(),
            execution_context_id: 1,
        });
        settle().await;
        assert!(handler.seen.lock().unwrap().is_empty());
        assert_eq!(bridge.errors().len(), 1);
        assert!(bridge.errors()[0].contains('1'));

        assert_eq!(session.open_context("iso-late", "audit-world", "f9", false), 1);
        session.send("sendOut", "iso-late", json!({"type": "cmpDetected", "cmp": "Acme"}));
        settle().await;

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0["type"], "cmpDetected");
        assert_eq!(seen[0].1, "iso-late");
        pump.abort();
    }

    #[tokio::test]
    async fn default_world_eval_maps_through_the_frame() {
        let session = Arc::new(FakeSession::new(&["f1"]).responder(|_, ctx, expr| {
            if ctx == "main-f1" && expr == "document.title" {
                Ok(Some(json!("Shop")))
            } else if ctx == "main-f1" {
                Ok(Some(json!(0)))
            } else {
                Ok(None)
            }
        }));
        let bridge = Bridge::new(Arc::clone(&session), config());
        let pump = bridge
            .subscribe(Arc::new(Recorder::default()))
            .await
            .unwrap();
        session.open_default_context("f1");
        bridge.create_contexts_for_all_frames().await;
        settle().await;

        assert!(bridge.evaluate_in_default_world("iso-f1", "document.title").await);
        assert!(!bridge.evaluate_in_default_world("iso-f1", "0").await);
        assert!(!bridge.evaluate_in_default_world("iso-unknown", "1").await);
        pump.abort();
    }

    #[tokio::test]
    async fn binding_is_scoped_to_the_world() {
        let session = Arc::new(FakeSession::new(&[]));
        let bridge = Bridge::new(Arc::clone(&session), config());
        bridge.add_binding().await;
        assert_eq!(
            session.bindings.lock().unwrap().clone(),
            vec![("sendOut".to_string(), "audit-world".to_string())]
        );
    }
}
