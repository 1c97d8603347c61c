//! The slice of the DevTools protocol the bridge needs, behind a trait.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::{
    CreateIsolatedWorldParams, FrameId, FrameTree, GetFrameTreeParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    AddBindingParams, EvaluateParams, EventBindingCalled, EventExecutionContextCreated,
};
use chromiumoxide::Page;
use futures::stream::BoxStream;
use futures::StreamExt;

/// Failure of a single best-effort browser call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Diagnostic {
    #[error("protocol call failed: {0}")]
    Call(String),
    #[error("evaluation threw: {0}")]
    Exception(String),
    #[error("unknown execution context {0}")]
    UnknownContext(String),
    #[error("invalid binding payload: {0}")]
    Payload(String),
}

impl Diagnostic {
    fn call(err: impl std::fmt::Display) -> Self {
        Self::Call(err.to_string())
    }
}

/// Protocol notifications the bridge consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    ContextCreated {
        id: i64,
        unique_id: String,
        name: String,
        frame_id: Option<String>,
        is_default: bool,
    },
    BindingCalled {
        name: String,
        payload: String,
        execution_context_id: i64,
    },
}

#[async_trait]
pub trait ProtocolSession: Send + Sync + 'static {
    /// Every frame id in the tab, parents before children.
    async fn frame_ids(&self) -> Result<Vec<String>, Diagnostic>;

    async fn create_isolated_world(&self, frame_id: &str, world_name: &str)
        -> Result<(), Diagnostic>;

    /// Expose `name` as a function in every context named `world_name`.
    async fn add_binding(&self, name: &str, world_name: &str) -> Result<(), Diagnostic>;

    /// Evaluate in the context with the given unique id. Returns the value
    /// when `return_by_value` is set.
    async fn evaluate(
        &self,
        unique_context_id: &str,
        expression: &str,
        return_by_value: bool,
    ) -> Result<Option<serde_json::Value>, Diagnostic>;

    /// Evaluate in the top frame's page world and return the value.
    async fn evaluate_in_page(&self, expression: &str)
        -> Result<Option<serde_json::Value>, Diagnostic>;

    /// Context-created and binding-called notifications, from now on.
    async fn events(&self) -> Result<BoxStream<'static, ProtocolEvent>, Diagnostic>;
}

/// [`ProtocolSession`] over a chromiumoxide page.
#[derive(Clone)]
pub struct ChromeSession {
    page: Page,
}

impl ChromeSession {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn run(&self, params: EvaluateParams) -> Result<Option<serde_json::Value>, Diagnostic> {
        let resp = self.page.execute(params).await.map_err(Diagnostic::call)?;
        if let Some(details) = &resp.result.exception_details {
            return Err(Diagnostic::Exception(details.text.clone()));
        }
        Ok(resp.result.result.value.clone())
    }
}

fn walk_frames(tree: &FrameTree, out: &mut Vec<String>) {
    out.push(tree.frame.id.as_ref().to_string());
    for child in tree.child_frames.iter().flatten() {
        walk_frames(child, out);
    }
}

#[async_trait]
impl ProtocolSession for ChromeSession {
    async fn frame_ids(&self) -> Result<Vec<String>, Diagnostic> {
        let tree = self
            .page
            .execute(GetFrameTreeParams::default())
            .await
            .map_err(Diagnostic::call)?;
        let mut ids = Vec::new();
        walk_frames(&tree.result.frame_tree, &mut ids);
        Ok(ids)
    }

    async fn create_isolated_world(
        &self,
        frame_id: &str,
        world_name: &str,
    ) -> Result<(), Diagnostic> {
        let params = CreateIsolatedWorldParams::builder()
            .frame_id(FrameId::new(frame_id))
            .world_name(world_name)
            .grant_univeral_access(true)
            .build()
            .map_err(Diagnostic::Call)?;
        self.page.execute(params).await.map_err(Diagnostic::call)?;
        Ok(())
    }

    async fn add_binding(&self, name: &str, world_name: &str) -> Result<(), Diagnostic> {
        let params = AddBindingParams::builder()
            .name(name)
            .execution_context_name(world_name)
            .build()
            .map_err(Diagnostic::Call)?;
        self.page.execute(params).await.map_err(Diagnostic::call)?;
        Ok(())
    }

    async fn evaluate(
        &self,
        unique_context_id: &str,
        expression: &str,
        return_by_value: bool,
    ) -> Result<Option<serde_json::Value>, Diagnostic> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .unique_context_id(unique_context_id)
            .return_by_value(return_by_value)
            .allow_unsafe_eval_blocked_by_csp(true)
            .build()
            .map_err(Diagnostic::Call)?;
        self.run(params).await
    }

    async fn evaluate_in_page(
        &self,
        expression: &str,
    ) -> Result<Option<serde_json::Value>, Diagnostic> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .return_by_value(true)
            .build()
            .map_err(Diagnostic::Call)?;
        self.run(params).await
    }

    async fn events(&self) -> Result<BoxStream<'static, ProtocolEvent>, Diagnostic> {
        let created = self
            .page
            .event_listener::<EventExecutionContextCreated>()
            .await
            .map_err(Diagnostic::call)?
            .map(|ev| {
                let ctx = &ev.context;
                let aux = ctx.aux_data.as_ref();
                let aux_str = |key: &str| {
                    aux.and_then(|a| a.get(key))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                };
                ProtocolEvent::ContextCreated {
                    id: *ctx.id.inner(),
                    unique_id: ctx.unique_id.clone(),
                    name: ctx.name.clone(),
                    is_default: aux
                        .and_then(|a| a.get("isDefault"))
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                        || aux_str("type").as_deref() == Some("default"),
                    frame_id: aux_str("frameId"),
                }
            });
        let bindings = self
            .page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(Diagnostic::call)?
            .map(|ev| ProtocolEvent::BindingCalled {
                name: ev.name.clone(),
                payload: ev.payload.clone(),
                execution_context_id: *ev.execution_context_id.inner(),
            });
        Ok(futures::stream::select(created, bindings).boxed())
    }
}
