//! Lead pipeline domain module.
//!
//! This crate contains the lead record and its derived follow-up/snooze state,
//! implemented purely as deterministic domain logic (no IO, no storage). Every
//! time-dependent operation takes `now` explicitly.

pub mod agent;
pub mod interaction;
pub mod lead;
pub mod performance;

pub use agent::Agent;
pub use interaction::{Interaction, InteractionType};
pub use lead::{EngagementLevel, Lead, LeadOutcome, LeadSnapshot, Score};
pub use performance::{AgentPerformanceSnapshot, ReportingPeriod};
