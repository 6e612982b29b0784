/// Storage trait and the in-memory implementation
pub mod repository;

/// JSON snapshot file implementation
pub mod file_repository;

/// Latest-value cache with a background durable writer
pub mod metric_store;

pub use file_repository::JsonFileRepository;
pub use metric_store::MetricStore;
pub use repository::{IdSequence, MaxIds, MemoryRepository, Repository};
