//! `leadflow-core`: shared building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{AgentId, InteractionId, LeadId, OrganisationId};
