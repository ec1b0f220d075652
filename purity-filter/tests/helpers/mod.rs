//! Test doubles and fixtures shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use purity_common::db::{ImageAnnotation, License, SafeSearchScores};
use purity_common::{Error, Result};
use purity_filter::services::{
    AnnotationStore, BatchClassifier, ClassificationProvider, LicenseLedger, MemoryAnnotationStore,
    MemoryLicenseLedger, MeterError, ProviderError, ProviderItem, UsageMeter,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TRIAL_ID: &str = "5d3c2a10-8f4b-4e6a-9b1c-0a2d3e4f5a6b";
pub const PAID_ID: &str = "9a8b7c6d-5e4f-4a3b-8c2d-1e0f9a8b7c6d";
pub const MAX_USAGE: u64 = 10;

pub fn refs(uris: &[&str]) -> Vec<String> {
    uris.iter().map(|u| u.to_string()).collect()
}

pub fn uri(name: &str) -> String {
    format!("https://images.example.com/{}.jpg", name)
}

pub fn license(id: &str, request_count: u64, is_trial: bool) -> License {
    License {
        id: id.to_string(),
        email: "owner@example.com".to_string(),
        stripe_id: format!("cus_{}", &id[..8]),
        subscription_id: if is_trial { String::new() } else { "sub_123".to_string() },
        is_valid: true,
        validity_reason: String::new(),
        request_count,
        is_trial,
    }
}

pub fn cached(uri: &str, adult: i16) -> ImageAnnotation {
    ImageAnnotation::new(uri, SafeSearchScores { adult, ..Default::default() }, None)
}

/// Scores every reference as POSSIBLE adult content unless told otherwise
#[derive(Default)]
pub struct StubProvider {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub submitted: AtomicUsize,
    /// Per-reference item errors
    pub item_errors: Mutex<HashMap<String, String>>,
    /// Positions past this count get no response
    pub respond_to: Mutex<Option<usize>>,
    pub fail: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
}

impl StubProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> Vec<String> {
        self.calls.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ClassificationProvider for StubProvider {
    async fn classify_batch(
        &self,
        references: &[String],
    ) -> std::result::Result<Vec<Option<ProviderItem>>, ProviderError> {
        self.calls.lock().unwrap().push(references.to_vec());
        self.submitted.fetch_add(references.len(), Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::ApiError(503, "backend unavailable".to_string()));
        }

        let errors = self.item_errors.lock().unwrap().clone();
        let respond_to = self.respond_to.lock().unwrap().unwrap_or(references.len());
        Ok(references
            .iter()
            .take(respond_to)
            .map(|reference| {
                Some(match errors.get(reference) {
                    Some(message) => ProviderItem {
                        scores: None,
                        error: Some(message.clone()),
                    },
                    None => ProviderItem {
                        scores: Some(SafeSearchScores {
                            adult: 3,
                            spoof: 1,
                            medical: 1,
                            violence: 2,
                            racy: 4,
                        }),
                        error: None,
                    },
                })
            })
            .collect())
    }
}

/// Records every report; optionally fails
#[derive(Default)]
pub struct RecordingMeter {
    pub reports: Mutex<Vec<(String, u64)>>,
    pub fail: AtomicBool,
}

impl RecordingMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reports(&self) -> Vec<(String, u64)> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl UsageMeter for RecordingMeter {
    async fn report(&self, license: &License, quantity: u64) -> std::result::Result<(), MeterError> {
        self.reports.lock().unwrap().push((license.id.clone(), quantity));
        if self.fail.load(Ordering::SeqCst) {
            return Err(MeterError::ApiError(500, "stripe down".to_string()));
        }
        Ok(())
    }
}

/// Memory store whose reads or writes can be switched off
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryAnnotationStore,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl AnnotationStore for FlakyStore {
    async fn find_by_references(&self, references: &[String]) -> Result<Vec<ImageAnnotation>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Internal("cache unavailable".to_string()));
        }
        self.inner.find_by_references(references).await
    }

    async fn insert_all(&self, records: &[ImageAnnotation]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Internal("disk full".to_string()));
        }
        self.inner.insert_all(records).await
    }

    async fn delete_by_reference(&self, reference: &str) -> Result<u64> {
        self.inner.delete_by_reference(reference).await
    }
}

/// Memory ledger that counts calls and can fail lookups or increments
#[derive(Default)]
pub struct CountingLedger {
    pub inner: MemoryLicenseLedger,
    pub lookups: AtomicUsize,
    pub expirations: AtomicUsize,
    pub fail_lookups: AtomicBool,
    pub fail_usage: AtomicBool,
}

impl CountingLedger {
    pub fn with_licenses(licenses: impl IntoIterator<Item = License>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryLicenseLedger::with_licenses(licenses),
            ..Default::default()
        })
    }

    pub async fn current(&self, id: &str) -> License {
        self.inner.get_by_id(id).await.unwrap().unwrap()
    }
}

#[async_trait]
impl LicenseLedger for CountingLedger {
    async fn get_by_id(&self, id: &str) -> Result<Option<License>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(Error::Internal("ledger unavailable".to_string()));
        }
        self.inner.get_by_id(id).await
    }

    async fn get_by_billing_account(&self, stripe_id: &str) -> Result<Option<License>> {
        self.inner.get_by_billing_account(stripe_id).await
    }

    async fn update(&self, license: &License) -> Result<()> {
        self.inner.update(license).await
    }

    async fn add_usage(&self, id: &str, count: u64) -> Result<u64> {
        if self.fail_usage.load(Ordering::SeqCst) {
            return Err(Error::Internal("counter update failed".to_string()));
        }
        self.inner.add_usage(id, count).await
    }

    async fn expire_trial(&self, license: &License) -> Result<License> {
        self.expirations.fetch_add(1, Ordering::SeqCst);
        self.inner.expire_trial(license).await
    }
}

/// Classifier wired to doubles, with handles kept for assertions
pub struct Harness {
    pub store: Arc<FlakyStore>,
    pub ledger: Arc<CountingLedger>,
    pub provider: Arc<StubProvider>,
    pub meter: Arc<RecordingMeter>,
    pub classifier: Arc<BatchClassifier>,
}

impl Harness {
    pub fn new(licenses: impl IntoIterator<Item = License>) -> Self {
        let store = FlakyStore::new();
        let ledger = CountingLedger::with_licenses(licenses);
        let provider = StubProvider::new();
        let meter = RecordingMeter::new();
        let classifier = Arc::new(BatchClassifier::new(
            store.clone(),
            ledger.clone(),
            provider.clone(),
            meter.clone(),
            MAX_USAGE,
        ));

        Self {
            store,
            ledger,
            provider,
            meter,
            classifier,
        }
    }

    pub async fn seed_cache(&self, records: &[ImageAnnotation]) {
        self.store.inner.insert_all(records).await.unwrap();
    }
}
