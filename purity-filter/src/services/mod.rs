//! Classification pipeline services

pub mod annotation_store;
pub mod classifier;
pub mod license_ledger;
pub mod usage_meter;
pub mod vision_client;

pub use annotation_store::{AnnotationStore, MemoryAnnotationStore, SqliteAnnotationStore};
pub use classifier::{BatchClassifier, ClassifyError};
pub use license_ledger::{LicenseLedger, MemoryLicenseLedger, SqliteLicenseLedger};
pub use usage_meter::{MeterError, NoopUsageMeter, StripeUsageMeter, UsageMeter};
pub use vision_client::{ClassificationProvider, ProviderError, ProviderItem, VisionClient};
