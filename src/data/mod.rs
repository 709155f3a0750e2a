//! Data domain: tabular records, feature engineering and training snapshots.

pub mod domain;
pub mod repo_fs;
pub mod repo_mem;
pub mod service;

pub use domain::{
    DataSource, FeatureMatrix, FeatureRule, FeatureSet, FittedRule, Record, RuleKind, RuleStats,
    Value,
};
pub use repo_fs::FsDataSource;
pub use repo_mem::MemoryDataSource;
pub use service::{build_features, fit_feature_set};
