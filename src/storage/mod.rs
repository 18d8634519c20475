pub mod artifacts;
pub mod memory;
pub mod mongo;
pub mod queue;

pub use artifacts::ArtifactStore;
pub use memory::MemoryQueue;
pub use mongo::MongoQueue;
pub use queue::{
    DomainCompletion, DomainRecord, DomainStatus, NewUrl, StallResets, TaskQueue, UrlCompletion,
    UrlCounts, UrlRecord, UrlStatus,
};
