pub mod element;
pub mod error;
pub mod interaction;
pub mod processor;
pub mod scheduler;
pub mod urls;
pub mod viewport;

pub use element::{
    DetectionReport, ElementDescriptor, InteractionRecord, InteractionVerb, PopupCapture,
    RedirectEdge, Scrollability, SuggestedInteraction, UrlOutcome,
};
pub use error::{CrawlError, TimeoutScope};
pub use interaction::{InteractionBudget, InteractionEngine, InteractionSession};
pub use processor::UrlProcessor;
pub use scheduler::{DomainScheduler, DomainStats};
pub use viewport::{ViewportExplorer, ViewportSweep};
