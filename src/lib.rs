//! Gluon Model Store - verified local cache for pretrained model weights
//!
//! Resolves a model zoo name such as `resnet50_v1` to a parameter file on
//! disk, downloading and checking the published archive when the local copy
//! is missing or does not match its recorded SHA-1.

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use models::{
    Archiver, CacheStatus, CachedModel, Downloader, HashVerifier, ModelCache, ModelRegistry,
    get_model_file, purge,
};
