//! The proxy core: binds credentials, linking, forwarding, and dispatch
//! into the request lifecycle.

pub mod dispatch;
pub mod notify;
pub mod orchestrator;
pub mod samples;
pub mod tracker;
pub mod types;

pub use dispatch::{Dispatcher, RequestSink};
pub use notify::Notifier;
pub use orchestrator::{ProxyOutcome, ProxyService};
pub use samples::SampleCollector;
pub use tracker::{DomainStats, TokenTracker};
pub use types::{ProxyRequest, RequestContext};
