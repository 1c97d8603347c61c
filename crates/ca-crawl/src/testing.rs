//! In-memory protocol session for bridge and collector tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use crate::protocol::{Diagnostic, ProtocolEvent, ProtocolSession};

/// Context name the fake reports for top-frame page evaluations.
pub const PAGE_CONTEXT: &str = "page";

type Responder =
    Box<dyn Fn(&FakeSession, &str, &str) -> Result<Option<Value>, Diagnostic> + Send + Sync>;

pub struct FakeSession {
    frames: Vec<String>,
    failing_frames: HashSet<String>,
    tx: UnboundedSender<ProtocolEvent>,
    rx: Mutex<Option<UnboundedReceiver<ProtocolEvent>>>,
    next_id: AtomicI64,
    ids: Mutex<HashMap<String, i64>>,
    responder: Responder,
    pub evaluations: Mutex<Vec<(String, String)>>,
    pub bindings: Mutex<Vec<(String, String)>>,
}

impl FakeSession {
    pub fn new(frames: &[&str]) -> Self {
        let (tx, rx) = unbounded();
        Self {
            frames: frames.iter().map(|f| f.to_string()).collect(),
            failing_frames: HashSet::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            next_id: AtomicI64::new(1),
            ids: Mutex::new(HashMap::new()),
            responder: Box::new(|_, _, _| Ok(None)),
            evaluations: Mutex::new(Vec::new()),
            bindings: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, frame: &str) -> Self {
        self.failing_frames.insert(frame.to_string());
        self
    }

    pub fn responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&FakeSession, &str, &str) -> Result<Option<Value>, Diagnostic>
            + Send
            + Sync
            + 'static,
    {
        self.responder = Box::new(f);
        self
    }

    /// Announce a context and return its raw id.
    pub fn open_context(&self, unique_id: &str, name: &str, frame: &str, is_default: bool) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.ids
            .lock()
            .unwrap()
            .insert(unique_id.to_string(), id);
        self.emit(ProtocolEvent::ContextCreated {
            id,
            unique_id: unique_id.to_string(),
            name: name.to_string(),
            frame_id: Some(frame.to_string()),
            is_default,
        });
        id
    }

    pub fn open_default_context(&self, frame: &str) -> i64 {
        self.open_context(&format!("main-{frame}"), "", frame, true)
    }

    pub fn raw_id(&self, unique_id: &str) -> Option<i64> {
        self.ids.lock().unwrap().get(unique_id).copied()
    }

    pub fn emit(&self, event: ProtocolEvent) {
        let _ = self.tx.unbounded_send(event);
    }

    /// Deliver `message` through binding `name` from the context `unique_id`.
    pub fn send(&self, name: &str, unique_id: &str, message: Value) {
        let execution_context_id = self.raw_id(unique_id).unwrap_or(-1);
        self.emit(ProtocolEvent::BindingCalled {
            name: name.to_string(),
            payload: message.to_string(),
            execution_context_id,
        });
    }

    pub fn evaluated(&self) -> Vec<(String, String)> {
        self.evaluations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProtocolSession for FakeSession {
    async fn frame_ids(&self) -> Result<Vec<String>, Diagnostic> {
        Ok(self.frames.clone())
    }

    async fn create_isolated_world(
        &self,
        frame_id: &str,
        world_name: &str,
    ) -> Result<(), Diagnostic> {
        if self.failing_frames.contains(frame_id) {
            return Err(Diagnostic::Call(format!("frame {frame_id} detached")));
        }
        self.open_context(&format!("iso-{frame_id}"), world_name, frame_id, false);
        Ok(())
    }

    async fn add_binding(&self, name: &str, world_name: &str) -> Result<(), Diagnostic> {
        self.bindings
            .lock()
            .unwrap()
            .push((name.to_string(), world_name.to_string()));
        Ok(())
    }

    async fn evaluate(
        &self,
        unique_context_id: &str,
        expression: &str,
        _return_by_value: bool,
    ) -> Result<Option<Value>, Diagnostic> {
        self.evaluations
            .lock()
            .unwrap()
            .push((unique_context_id.to_string(), expression.to_string()));
        (self.responder)(self, unique_context_id, expression)
    }

    async fn evaluate_in_page(&self, expression: &str) -> Result<Option<Value>, Diagnostic> {
        self.evaluate(PAGE_CONTEXT, expression, true).await
    }

    async fn events(&self) -> Result<BoxStream<'static, ProtocolEvent>, Diagnostic> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .map(|rx| rx.boxed())
            .ok_or_else(|| Diagnostic::Call("events already taken".to_string()))
    }
}
