// Claim settlement engine
pub mod confirmation;
pub mod gas_guard;
pub mod janitor;
pub mod nonce;
pub mod processor;
pub mod reconciler;
pub mod scheduler;
pub mod submitter;

pub use processor::{CycleSummary, SettlementEngine};
pub use scheduler::SettlementScheduler;
