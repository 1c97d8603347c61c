//! Third-party request capture for one tab.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventRequestWillBeSent, EventResponseReceived,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

use ca_core::models::RequestRecord;
use ca_core::thirdparty::is_third_party;

#[derive(Debug)]
struct Pending {
    method: String,
    timestamp: i64,
    post_data: Option<String>,
}

/// A request about to be sent, as reported by the browser.
#[derive(Debug, Default)]
pub struct OutgoingRequest<'a> {
    pub method: &'a str,
    pub post_data: Option<&'a str>,
    pub resource_type: Option<String>,
    /// The 3xx response that caused this request, if it is a redirect hop.
    pub redirected_from: Option<Hop<'a>>,
}

/// A response as reported by the browser.
#[derive(Debug)]
pub struct Hop<'a> {
    pub url: &'a str,
    pub status: i64,
    pub headers: BTreeMap<String, String>,
}

/// Requests seen so far, keyed by protocol request id until their response
/// arrives. Only third-party responses are kept.
#[derive(Debug)]
pub struct RecorderState {
    first_party: String,
    pending: HashMap<String, Pending>,
    records: Vec<RequestRecord>,
}

impl RecorderState {
    pub fn new(first_party: &str) -> Self {
        Self {
            first_party: first_party.to_string(),
            pending: HashMap::new(),
            records: Vec::new(),
        }
    }

    /// A redirect reuses the request id: the hop that answered 3xx is
    /// recorded first, then the id starts tracking the new request.
    pub fn on_request(&mut self, request_id: &str, request: OutgoingRequest<'_>, timestamp: i64) {
        if let Some(hop) = request.redirected_from {
            self.on_response(request_id, hop, request.resource_type.clone(), timestamp);
        }
        self.pending.insert(
            request_id.to_string(),
            Pending {
                method: request.method.to_string(),
                timestamp,
                post_data: request.post_data.map(str::to_string),
            },
        );
    }

    pub fn on_response(
        &mut self,
        request_id: &str,
        response: Hop<'_>,
        resource_type: Option<String>,
        now: i64,
    ) {
        let pending = self.pending.remove(request_id);
        if !is_third_party(response.url, &self.first_party) {
            return;
        }
        let (method, timestamp, post_data) = match pending {
            Some(p) => (p.method, p.timestamp, p.post_data),
            None => ("GET".to_string(), now, None),
        };
        self.records.push(RequestRecord {
            url: response.url.to_string(),
            method,
            status: Some(response.status),
            headers: response.headers,
            resource_type,
            timestamp,
            post_data,
        });
    }

    /// Failed or cancelled requests never get a response.
    pub fn on_failed(&mut self, request_id: &str) {
        self.pending.remove(request_id);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn records(&self) -> &[RequestRecord] {
        &self.records
    }
}

/// Flatten a protocol header object into `name -> value` strings.
fn header_map(raw: &serde_json::Value) -> BTreeMap<String, String> {
    raw.as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let value = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

pub struct RequestRecorder {
    state: Arc<Mutex<RecorderState>>,
    listeners: Vec<JoinHandle<()>>,
}

impl RequestRecorder {
    /// Start listening on `page`. Must be attached before navigation.
    pub async fn attach(page: &Page, first_party: &str) -> Result<Self> {
        let state = Arc::new(Mutex::new(RecorderState::new(first_party)));

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .context("failed to listen for requests")?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .context("failed to listen for responses")?;
        let mut failures = page
            .event_listener::<EventLoadingFailed>()
            .await
            .context("failed to listen for failed loads")?;

        let on_request = Arc::clone(&state);
        let request_task = tokio::spawn(async move {
            while let Some(ev) = requests.next().await {
                let now = Utc::now().timestamp_millis();
                let redirected_from = ev.redirect_response.as_ref().map(|r| Hop {
                    url: &r.url,
                    status: r.status,
                    headers: header_map(r.headers.inner()),
                });
                let request = OutgoingRequest {
                    method: &ev.request.method,
                    post_data: ev.request.post_data.as_deref(),
                    resource_type: ev.r#type.as_ref().map(|t| format!("{t:?}")),
                    redirected_from,
                };
                if let Ok(mut s) = on_request.lock() {
                    s.on_request(ev.request_id.inner(), request, now);
                }
            }
        });

        let on_failure = Arc::clone(&state);
        let failure_task = tokio::spawn(async move {
            while let Some(ev) = failures.next().await {
                if let Ok(mut s) = on_failure.lock() {
                    s.on_failed(ev.request_id.inner());
                }
            }
        });

        let on_response = Arc::clone(&state);
        let response_task = tokio::spawn(async move {
            while let Some(ev) = responses.next().await {
                let now = Utc::now().timestamp_millis();
                let response = Hop {
                    url: &ev.response.url,
                    status: ev.response.status,
                    headers: header_map(ev.response.headers.inner()),
                };
                if let Ok(mut s) = on_response.lock() {
                    s.on_response(
                        ev.request_id.inner(),
                        response,
                        Some(format!("{:?}", ev.r#type)),
                        now,
                    );
                }
            }
        });

        Ok(Self {
            state,
            listeners: vec![request_task, response_task, failure_task],
        })
    }

    pub fn records(&self) -> Vec<RequestRecord> {
        self.state
            .lock()
            .map(|s| s.records().to_vec())
            .unwrap_or_default()
    }

    pub fn detach(&self) {
        for task in &self.listeners {
            task.abort();
        }
    }
}
