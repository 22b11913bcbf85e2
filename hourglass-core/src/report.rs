//! Report execution contract.
//!
//! The external report API is slow (creation, polling and download can take
//! seconds to tens of minutes), quota-limited, and may legitimately return
//! coverage for only a subset of the hours it was asked for. The ledger never
//! talks to it directly; it goes through the [`ReportExecutor`] trait so the
//! whole create/poll/download cycle is a single awaited call that tests can
//! substitute.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// One report request covering `[start, end)` for a namespace.
///
/// `hours` lists the individual hour-starts the caller expects the report to
/// cover; the span they form is always contiguous.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRequest {
    pub namespace: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub hours: Vec<DateTime<Utc>>,
}

/// What a completed report actually delivered.
///
/// `covered_hours` may be a strict subset of the requested hours: an hour with
/// no data upstream simply does not appear. Absence is not failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportOutcome {
    pub report_id: String,
    pub covered_hours: HashSet<DateTime<Utc>>,
}

/// Failure modes of a report call.
///
/// Quota exhaustion is split out because the caller's scheduling loop applies
/// a namespace-wide cooldown for it, on top of the per-hour backoff every
/// failure gets.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("transient report failure: {0}")]
    Transient(String),
    #[error("report quota exceeded: {0}")]
    QuotaExceeded(String),
}

/// Executes the full report creation/poll/download cycle for one window.
#[async_trait]
pub trait ReportExecutor: Send + Sync {
    async fn execute(&self, request: ReportRequest) -> Result<ReportOutcome, ReportError>;
}

/// HTTP-backed executor speaking to the report sidecar.
///
/// The sidecar owns the vendor protocol (authentication, polling cadence,
/// download and row persistence); this client only submits the window and
/// reads back which hours were covered.
#[derive(Clone)]
pub struct HttpReportExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReportExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ReportExecutor for HttpReportExecutor {
    async fn execute(&self, request: ReportRequest) -> Result<ReportOutcome, ReportError> {
        let url = format!("{}/reports", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ReportError::Transient(format!("report request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(ReportError::QuotaExceeded(format!(
                "report API returned 429: {body}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, namespace = %request.namespace, "report API rejected window");
            return Err(ReportError::Transient(format!(
                "report API returned {status}: {body}"
            )));
        }

        response
            .json::<ReportOutcome>()
            .await
            .map_err(|e| ReportError::Transient(format!("malformed report response: {e}")))
    }
}
