//! Model registry and inference resolution for versioned regression models.
//!
//! A [`Ledger`] records every registered `(model_id, version)`; a
//! [`VersionAllocator`] derives the next version from it; the
//! [`InferenceResolver`] turns a prediction request into a predictor call through
//! the artifact indirection and the [`FeatureReconciler`]. [`ModelService`] is the
//! only surface the presentation layer needs.

pub mod allocator;
pub mod artifact;
pub mod cache;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod reconcile;
pub mod record;
pub mod reference;
pub mod resolver;
pub mod service;

pub use allocator::VersionAllocator;
pub use artifact::{ArtifactLocation, ArtifactStore, PointerResolver};
pub use cache::PredictorCache;
pub use error::{ErrorKind, InvocationFailure, RegistryError, Result};
pub use ledger::{BeforeWrite, FileLedger, FileLedgerOptions, Ledger, LedgerSnapshot, LedgerStore, MemoryLedger, Revision};
pub use reconcile::{AttributeMap, AttributeValue, FeatureReconciler, PredictionRequest, ReconciledFeatureVector};
pub use record::{ModelRecord, NewModel, Version};
pub use reference::{ReferenceData, ReferenceTable};
pub use resolver::{InferenceResolver, Prediction};
pub use service::{ModelService, ModelServiceBuilder, PointerMode};
pub use valuation_resilience::RetryConfig;
