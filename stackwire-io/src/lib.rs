pub mod hub;
pub mod interests;
pub mod metrics;

pub use hub::{Cancellable, Hub, HubClosed, HubListener};
pub use interests::Interests;
pub use metrics::HubMetrics;
