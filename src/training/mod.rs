//! Model lifecycle: definitions, versions, the registry state machine and the
//! orchestrator that trains versions on a worker pool.

pub mod algorithms;
pub mod domain;
pub mod orchestrator;
pub mod registry;
pub mod repo_fs;
pub mod repo_mem;
pub mod workers;

pub use algorithms::{Algorithm, AlgorithmCatalog, Inference, Predictor, TrainingControl};
pub use domain::{
    DefinitionSpec, Hyperparameters, JobStatus, ModelDefinition, ModelVersion, RegistryRepo,
    TaskType, TrainingJob, VersionStatus,
};
pub use orchestrator::TrainingOrchestrator;
pub use registry::{ActiveSummary, ModelRegistry};
pub use repo_fs::FsRegistryRepo;
pub use repo_mem::MemoryRepo;
