//! Infrastructure layer: task orchestration, job bodies, stores, config,
//! external collaborators.

pub mod broker;
pub mod config;
pub mod jobs;
pub mod notify;
pub mod repository;
pub mod service;
pub mod tasks;

pub use broker::{BrokerProbe, BrokerUnavailableError, StaticBrokerProbe, probe_for};
pub use config::{ConfigError, LeadflowConfig};
pub use service::{LeadScoringService, ServiceDeps, ServiceError, open_model_store};
