use std::collections::VecDeque;

use adsync_core::SyncError;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{AdsApi, InsightsPage, InsightsRequest};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub request: InsightsRequest,
    pub cursor: Option<String>,
}

/// Replays a scripted sequence of pages and errors, one per call. Once the
/// script runs out every call returns an empty last page.
#[derive(Debug, Default)]
pub struct FixtureAdsApi {
    script: Mutex<VecDeque<Result<InsightsPage, SyncError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FixtureAdsApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: impl IntoIterator<Item = Result<InsightsPage, SyncError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn push_page(&self, page: InsightsPage) {
        self.script.lock().await.push_back(Ok(page));
    }

    pub async fn push_error(&self, err: SyncError) {
        self.script.lock().await.push_back(Err(err));
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.script.lock().await.len()
    }
}

#[async_trait]
impl AdsApi for FixtureAdsApi {
    async fn fetch_insights(
        &self,
        request: &InsightsRequest,
        cursor: Option<&str>,
    ) -> Result<InsightsPage, SyncError> {
        self.calls.lock().await.push(RecordedCall {
            request: request.clone(),
            cursor: cursor.map(str::to_string),
        });
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(InsightsPage::default()))
    }
}
