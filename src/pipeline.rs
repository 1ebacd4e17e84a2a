use crate::catalog::{
    RawListing, ReconcileError, Reconciler, ScanOutcome, SellerProfile, SkippedListing,
};
use crate::enrich::{Enricher, merge_enrichment};
use crate::models::StageReport;
use crate::source::{ListingSource, SellerScope, SourceBatch, SourceError};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::{collections::HashMap, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Source -> enrich -> reconcile, one seller at a time.
#[derive(Clone)]
pub struct Pipeline {
    source: Arc<dyn ListingSource>,
    enricher: Arc<dyn Enricher>,
    reconciler: Reconciler,
    sellers: Arc<Vec<SellerProfile>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SellerFailure {
    pub seller_phone: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub sellers_processed: usize,
    pub listings_scraped: usize,
    pub scans: Vec<ScanOutcome>,
    pub failures: Vec<SellerFailure>,
    /// Source records that never reached a seller scan.
    pub skipped: Vec<SkippedListing>,
    pub stages: Vec<StageReport>,
    pub aborted: Option<PipelineError>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn ListingSource>,
        enricher: Arc<dyn Enricher>,
        reconciler: Reconciler,
        sellers: Vec<SellerProfile>,
    ) -> Self {
        Self {
            source,
            enricher,
            reconciler,
            sellers: Arc::new(sellers),
        }
    }

    /// Runs one reconciliation pass. Seller-level store failures are collected in the
    /// report and the run moves on; source failures and cancellation abort the run.
    /// An aborted report still carries every scan committed before the abort.
    pub async fn run<F>(&self, scope: &SellerScope, cancel: &CancellationToken, log: F) -> RunReport
    where
        F: Fn(String) + Send + Sync,
    {
        let mut report = RunReport::default();
        if let Err(err) = self.run_into(scope, cancel, &log, &mut report).await {
            report.aborted = Some(err);
        }
        report
    }

    async fn run_into<F>(
        &self,
        scope: &SellerScope,
        cancel: &CancellationToken,
        log: &F,
        report: &mut RunReport,
    ) -> Result<(), PipelineError>
    where
        F: Fn(String) + Send + Sync,
    {

        let batch = self
            .capture_stage("fetch_listings", &mut report.stages, async {
                let batch = self
                    .source
                    .fetch(scope, cancel)
                    .await
                    .map_err(PipelineError::from_source)?;
                let output = json!({
                    "listings": batch.listings.len(),
                    "skipped": batch.skipped.len(),
                    "exit_code": batch.output.as_ref().and_then(|o| o.exit_code),
                });
                Ok(StageOutcome::new(batch, output))
            })
            .await?;
        let SourceBatch {
            listings,
            skipped,
            output,
        } = batch;
        if let Some(output) = &output {
            output.lines().for_each(log);
        }
        report.listings_scraped = listings.len();
        report.skipped = skipped;

        let groups = group_by_seller(listings);
        log(format!(
            "Fetched {} listings from {} seller(s)",
            report.listings_scraped,
            groups.len()
        ));

        for (phone, raw) in groups {
            if cancel.is_cancelled() {
                return Err(PipelineError::cancelled("reconcile"));
            }
            let profile = self.resolve_profile(&phone, &raw);

            let enriched = self
                .capture_stage("enrich", &mut report.stages, async {
                    let results = self.enricher.enrich(&raw).await;
                    let attributed = results
                        .iter()
                        .filter(|r| r.attributes != Default::default())
                        .count();
                    let output = json!({ "seller": phone, "listings": raw.len(), "attributed": attributed });
                    Ok(StageOutcome::new(merge_enrichment(raw.clone(), results), output))
                })
                .await?;

            let scan_time = Utc::now();
            let result = self
                .capture_stage("reconcile", &mut report.stages, async {
                    let outcome = self
                        .reconciler
                        .reconcile_seller(&profile, enriched, scan_time, cancel)
                        .await;
                    let output = match &outcome {
                        Ok(scan) => json!({
                            "seller": phone,
                            "found": scan.summary.products_found,
                            "new": scan.summary.products_new,
                            "updated": scan.summary.products_updated,
                            "deactivated": scan.deactivated.len(),
                        }),
                        Err(err) => json!({ "seller": phone, "error": err.to_string() }),
                    };
                    Ok(StageOutcome::new(outcome, output))
                })
                .await?;

            report.sellers_processed += 1;
            match result {
                Ok(scan) => {
                    log(format!(
                        "Seller {phone}: {} found, {} new, {} updated, {} deactivated",
                        scan.summary.products_found,
                        scan.summary.products_new,
                        scan.summary.products_updated,
                        scan.deactivated.len()
                    ));
                    report.scans.push(scan);
                }
                Err(ReconcileError::Cancelled { committed_batches }) => {
                    warn!(target = "catalog.pipeline", seller = %phone, committed_batches, "run_cancelled");
                    return Err(PipelineError::cancelled("reconcile"));
                }
                Err(err) => {
                    let detail = error_chain(&err);
                    warn!(target = "catalog.pipeline", seller = %phone, error = %detail, "seller_failed");
                    log(format!("Seller {phone} failed: {detail}"));
                    report.failures.push(SellerFailure {
                        seller_phone: phone.clone(),
                        error: detail,
                    });
                }
            }
        }

        info!(
            target = "catalog.pipeline",
            sellers = report.sellers_processed,
            listings = report.listings_scraped,
            failures = report.failures.len(),
            "run_reconciled"
        );
        Ok(())
    }

    /// Seed config wins per field; otherwise the first non-blank value carried by the
    /// seller's listings.
    fn resolve_profile(&self, phone: &str, listings: &[RawListing]) -> SellerProfile {
        let seed = self.sellers.iter().find(|s| s.phone == phone);
        let first = |pick: fn(&RawListing) -> Option<&String>| {
            listings
                .iter()
                .filter_map(pick)
                .map(|v| v.trim())
                .find(|v| !v.is_empty())
                .map(str::to_string)
        };
        SellerProfile {
            phone: phone.to_string(),
            name: seed
                .and_then(|s| s.name.clone())
                .or_else(|| first(|l| l.seller_name.as_ref())),
            city: seed
                .and_then(|s| s.city.clone())
                .or_else(|| first(|l| l.seller_city.as_ref())),
            catalogue_url: seed
                .and_then(|s| s.catalogue_url.clone())
                .or_else(|| first(|l| l.seller_catalogue_url.as_ref())),
        }
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

/// Splits a flat scan into per-seller groups, ordered by first appearance.
pub fn group_by_seller(listings: Vec<RawListing>) -> Vec<(String, Vec<RawListing>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<RawListing>)> = Vec::new();
    for listing in listings {
        match index.get(&listing.seller_phone) {
            Some(&at) => groups[at].1.push(listing),
            None => {
                index.insert(listing.seller_phone.clone(), groups.len());
                groups.push((listing.seller_phone.clone(), vec![listing]));
            }
        }
    }
    groups
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    SourceUnavailable,
    AuthRequired,
    Cancelled,
}

impl PipelineError {
    pub fn source_unavailable(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::SourceUnavailable,
        }
    }

    pub fn auth_required(stage: &'static str) -> Self {
        Self {
            stage,
            message: "storefront login required".into(),
            kind: PipelineErrorKind::AuthRequired,
        }
    }

    pub fn cancelled(stage: &'static str) -> Self {
        Self {
            stage,
            message: "run stopped".into(),
            kind: PipelineErrorKind::Cancelled,
        }
    }

    fn from_source(err: SourceError) -> Self {
        const STAGE: &str = "fetch_listings";
        match err {
            SourceError::AuthRequired => Self::auth_required(STAGE),
            SourceError::Cancelled => Self::cancelled(STAGE),
            SourceError::Unavailable(message) => Self::source_unavailable(STAGE, message),
            SourceError::Io(err) => Self::source_unavailable(STAGE, err.to_string()),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}
