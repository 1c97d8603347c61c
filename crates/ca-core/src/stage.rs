use crate::models::{ConsentMode, CrawlOutput, RequestRecord, Stage, StagedRequest};

/// Assign a request to a consent stage.
///
/// Requests strictly before the action (or in a session with no action) are
/// pre-consent. A request at exactly the action timestamp is post-action.
pub fn classify(request: &RequestRecord, action_timestamp: Option<i64>, mode: ConsentMode) -> Stage {
    match action_timestamp {
        Some(action) if request.timestamp >= action => mode.post_action_stage(),
        _ => Stage::PreConsent,
    }
}

/// Classify every request captured by one crawl session.
pub fn partition(crawl: &CrawlOutput) -> Vec<StagedRequest> {
    crawl
        .requests
        .iter()
        .map(|request| StagedRequest {
            stage: classify(request, crawl.action_timestamp, crawl.mode),
            request: request.clone(),
        })
        .collect()
}
