//! Merge tagged tracker detections from both sessions into unique audit events.

use std::collections::HashMap;

use crate::canonical::{canonicalize, event_hash, CanonicalIdentity};
use crate::models::{
    AuditEvent, EventDataItem, ProviderInfo, RequestRecord, RequestSummary, ResponseSummary,
    StageSet, TaggedDetection, Tracker,
};

const DEFAULT_MIME: &str = "application/octet-stream";

/// Events and the distinct trackers they reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedEvents {
    pub events: Vec<AuditEvent>,
    pub trackers: Vec<Tracker>,
}

struct PendingEvent {
    hash: String,
    identity: CanonicalIdentity,
    stages: StageSet,
    first: TaggedDetection,
}

/// Hash-keyed accumulator. Each distinct hash keeps the payload of the first
/// detection pushed for it; later duplicates only add their stage.
#[derive(Default)]
pub struct EventNormalizer {
    index: HashMap<String, usize>,
    pending: Vec<PendingEvent>,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tagged: TaggedDetection) {
        if tagged.detection.provider_key.is_empty() || tagged.detection.url.is_empty() {
            log::debug!("Skipping detection without provider key or URL");
            return;
        }

        let identity = canonicalize(&tagged.detection.url);
        let hash = event_hash(&tagged.detection.provider_key, &identity);

        match self.index.get(&hash) {
            Some(&idx) => self.pending[idx].stages.insert(tagged.stage),
            None => {
                let mut stages = StageSet::default();
                stages.insert(tagged.stage);
                self.index.insert(hash.clone(), self.pending.len());
                self.pending.push(PendingEvent {
                    hash,
                    identity,
                    stages,
                    first: tagged,
                });
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn finish(self) -> NormalizedEvents {
        let mut events: Vec<AuditEvent> = self.pending.into_iter().map(into_event).collect();
        // Stable: equal timestamps keep insertion order.
        events.sort_by_key(|e| e.timestamp);

        let mut seen: HashMap<&str, ()> = HashMap::new();
        let mut trackers = Vec::new();
        for event in &events {
            if seen.insert(event.provider.key.as_str(), ()).is_none() {
                trackers.push(Tracker {
                    name: event.provider.name.clone(),
                    key: event.provider.key.clone(),
                    tracker_type: event.provider.provider_type.clone(),
                });
            }
        }
        trackers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.key.cmp(&b.key)));

        NormalizedEvents { events, trackers }
    }
}

/// Normalize a batch of detections in one pass.
pub fn normalize<I>(detections: I) -> NormalizedEvents
where
    I: IntoIterator<Item = TaggedDetection>,
{
    let mut normalizer = EventNormalizer::new();
    for tagged in detections {
        normalizer.push(tagged);
    }
    normalizer.finish()
}

fn into_event(pending: PendingEvent) -> AuditEvent {
    let PendingEvent {
        hash,
        identity,
        stages,
        first,
    } = pending;
    let TaggedDetection {
        detection,
        stage,
        request,
    } = first;

    let provider = ProviderInfo {
        name: non_empty_or(&detection.provider_name, "Unknown"),
        key: detection.provider_key.clone(),
        provider_type: non_empty_or(&detection.provider_type, "Unknown"),
        columns: detection.columns,
        groups: detection.groups,
    };

    let data = detection
        .fields
        .into_iter()
        .map(|f| EventDataItem {
            key: f.key,
            field: f.display_field,
            value: f.value,
            group: f.group,
            hidden: f.hidden,
        })
        .collect();

    AuditEvent {
        id: format!("evt_{}", &hash[..16]),
        event: "webRequest".to_string(),
        timestamp: request.timestamp,
        stage,
        seen_in_opt_in: stages.after_opt_in,
        seen_in_opt_out: stages.after_opt_out,
        leak: stages.after_opt_out,
        stages,
        third_party: true,
        resource_type: request
            .resource_type
            .clone()
            .unwrap_or_else(|| "Unknown".to_string()),
        request: RequestSummary {
            method: request.method.clone(),
            url: request.url.clone(),
            host: identity.host,
            path: identity.path,
            query_keys: identity.query_keys,
        },
        response: response_summary(&request),
        provider,
        data,
        hash,
    }
}

fn response_summary(request: &RequestRecord) -> ResponseSummary {
    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };
    ResponseSummary {
        status: request.status.unwrap_or(0),
        mime: header("content-type").unwrap_or(DEFAULT_MIME).to_string(),
        size_b: header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
