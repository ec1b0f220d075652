//! Batch classification orchestrator
//!
//! Resolves a batch of image references against the annotation cache,
//! enforces license and trial limits, classifies the remainder through the
//! provider, and writes results and usage back.
//!
//! Cache writes, usage increments and meter reports are best-effort: a
//! failure is logged and the caller still receives its results.
//!
//! Trial licenses are serialized per license id from the quota read through
//! the usage increment, so concurrent requests on one trial cannot classify
//! more images than the trial allows. Paid licenses are not serialized.

use purity_common::db::{ImageAnnotation, License, SafeSearchScores};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use super::annotation_store::AnnotationStore;
use super::license_ledger::LicenseLedger;
use super::usage_meter::{MeterError, UsageMeter};
use super::vision_client::{ClassificationProvider, ProviderError, ProviderItem};

/// Classification errors surfaced to the caller
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("license {0} not found")]
    LicenseNotFound(String),

    #[error("license is not valid: {0}")]
    LicenseInvalid(String),

    #[error("license lookup failed: {0}")]
    LicenseLookupFailed(#[source] purity_common::Error),

    /// Trial quota reached. Carries whatever could still be returned.
    #[error("trial license has expired")]
    TrialExhausted { results: Vec<ImageAnnotation> },

    #[error("classification provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("annotation cache lookup failed: {0}")]
    CacheLookupFailed(#[source] purity_common::Error),
}

/// License-gated, cache-aware batch classifier
pub struct BatchClassifier {
    store: Arc<dyn AnnotationStore>,
    ledger: Arc<dyn LicenseLedger>,
    provider: Arc<dyn ClassificationProvider>,
    meter: Arc<dyn UsageMeter>,
    trial_max_usage: u64,
    trial_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Unique references in first-seen order
pub fn dedup_references(references: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(references.len());
    references
        .iter()
        .filter(|reference| seen.insert(reference.as_str()))
        .cloned()
        .collect()
}

/// Records for `order`, skipping references with no record
fn merge_in_order(order: &[String], mut by_uri: HashMap<String, ImageAnnotation>) -> Vec<ImageAnnotation> {
    order
        .iter()
        .filter_map(|reference| by_uri.remove(reference))
        .collect()
}

fn annotation_for(uri: &str, item: Option<ProviderItem>) -> ImageAnnotation {
    match item {
        Some(item) => ImageAnnotation::new(uri, item.scores.unwrap_or_default(), item.error),
        None => ImageAnnotation::new(uri, SafeSearchScores::default(), None),
    }
}

impl BatchClassifier {
    pub fn new(
        store: Arc<dyn AnnotationStore>,
        ledger: Arc<dyn LicenseLedger>,
        provider: Arc<dyn ClassificationProvider>,
        meter: Arc<dyn UsageMeter>,
        trial_max_usage: u64,
    ) -> Self {
        Self {
            store,
            ledger,
            provider,
            meter,
            trial_max_usage,
            trial_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Classify `references` on behalf of `license_id`.
    ///
    /// Results follow the first-seen order of `references` with duplicates
    /// removed. References dropped at the trial boundary are absent.
    pub async fn classify(
        &self,
        references: &[String],
        license_id: &str,
        deadline: Duration,
    ) -> Result<Vec<ImageAnnotation>, ClassifyError> {
        let unique = dedup_references(references);
        if unique.is_empty() {
            return Err(ClassifyError::InvalidArgument(
                "at least one image reference is required".to_string(),
            ));
        }

        let cached: HashMap<String, ImageAnnotation> = self
            .store
            .find_by_references(&unique)
            .await
            .map_err(ClassifyError::CacheLookupFailed)?
            .into_iter()
            .map(|record| (record.uri.clone(), record))
            .collect();

        let uncached: Vec<String> = unique
            .iter()
            .filter(|reference| !cached.contains_key(*reference))
            .cloned()
            .collect();

        tracing::debug!(
            requested = unique.len(),
            cached = cached.len(),
            uncached = uncached.len(),
            "Resolved annotation cache"
        );

        if uncached.is_empty() {
            return Ok(merge_in_order(&unique, cached));
        }

        let license = self.load_license(license_id).await?;
        if !license.is_trial {
            return self.classify_uncached(&unique, cached, uncached, license, deadline).await;
        }

        let lock = self.trial_lock(&license.id).await;
        let _guard = lock.lock().await;
        // Re-read under the lock so the quota reflects concurrent requests
        let license = self.load_license(license_id).await?;
        self.classify_uncached(&unique, cached, uncached, license, deadline).await
    }

    async fn load_license(&self, license_id: &str) -> Result<License, ClassifyError> {
        self.ledger
            .get_by_id(license_id)
            .await
            .map_err(ClassifyError::LicenseLookupFailed)?
            .ok_or_else(|| ClassifyError::LicenseNotFound(license_id.to_string()))
    }

    async fn trial_lock(&self, license_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.trial_locks.lock().await;
        Arc::clone(
            locks
                .entry(license_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn expire(&self, license: &License) {
        if let Err(e) = self.ledger.expire_trial(license).await {
            tracing::error!(license_id = %license.id, error = %e, "Failed to record trial expiry");
        }
    }

    async fn classify_uncached(
        &self,
        unique: &[String],
        cached: HashMap<String, ImageAnnotation>,
        mut uncached: Vec<String>,
        license: License,
        deadline: Duration,
    ) -> Result<Vec<ImageAnnotation>, ClassifyError> {
        let mut truncated = false;

        if license.is_trial {
            let remaining = license.trial_remaining(self.trial_max_usage);
            if remaining <= 0 {
                tracing::info!(
                    license_id = %license.id,
                    request_count = license.request_count,
                    "Trial quota exhausted, skipping provider"
                );
                if license.is_valid {
                    self.expire(&license).await;
                }
                return Err(ClassifyError::TrialExhausted {
                    results: merge_in_order(unique, cached),
                });
            }

            let remaining = remaining as usize;
            if remaining < uncached.len() {
                tracing::info!(
                    license_id = %license.id,
                    remaining,
                    dropped = uncached.len() - remaining,
                    "Trial quota reached mid-batch, truncating"
                );
                uncached.truncate(remaining);
                truncated = true;
            }
        }

        if !license.is_valid {
            return Err(ClassifyError::LicenseInvalid(license.validity_reason.clone()));
        }

        let items = match tokio::time::timeout(deadline, self.provider.classify_batch(&uncached)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProviderError::Timeout(deadline).into()),
        };

        let mut items = items.into_iter();
        let fresh: Vec<ImageAnnotation> = uncached
            .iter()
            .map(|uri| annotation_for(uri, items.next().flatten()))
            .collect();

        for record in fresh.iter().filter(|record| record.error.is_some()) {
            tracing::warn!(uri = %record.uri, error = ?record.error, "Provider could not classify image");
        }

        if let Err(e) = self.store.insert_all(&fresh).await {
            tracing::error!(count = fresh.len(), error = %e, "Failed to cache new annotations");
        }

        let count = fresh.len() as u64;
        if count > 0 {
            self.record_usage(&license, count).await;
        }

        let mut by_uri = cached;
        by_uri.extend(fresh.into_iter().map(|record| (record.uri.clone(), record)));
        let results = merge_in_order(unique, by_uri);

        if truncated {
            Err(ClassifyError::TrialExhausted { results })
        } else {
            Ok(results)
        }
    }

    async fn record_usage(&self, license: &License, count: u64) {
        match self.ledger.add_usage(&license.id, count).await {
            Ok(request_count) => {
                let mut current = license.clone();
                current.request_count = request_count;
                if current.is_trial_exhausted(self.trial_max_usage) {
                    self.expire(&current).await;
                }
            }
            Err(e) => {
                tracing::error!(license_id = %license.id, count, error = %e, "Failed to record license usage");
            }
        }

        match self.meter.report(license, count).await {
            Ok(()) => {}
            Err(MeterError::NoSubscription(_)) => {
                tracing::debug!(license_id = %license.id, "No subscription to meter");
            }
            Err(e) => {
                tracing::warn!(license_id = %license.id, count, error = %e, "Failed to report metered usage");
            }
        }
    }
}
