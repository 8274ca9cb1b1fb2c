//! Broker reachability.
//!
//! The executor asks a [`BrokerProbe`] once, at construction. A failed probe
//! switches the whole session to inline execution; it is never a per-call
//! failure.

use tracing::debug;

use crate::config::LeadflowConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("broker unavailable: {0}")]
pub struct BrokerUnavailableError(pub String);

pub trait BrokerProbe: Send + Sync {
    fn check(&self) -> Result<(), BrokerUnavailableError>;
}

/// Probe with a fixed answer. Used when there is no external broker to ask
/// (the worker pool lives in-process) and in tests.
#[derive(Debug, Clone)]
pub struct StaticBrokerProbe {
    unavailable_reason: Option<String>,
}

impl StaticBrokerProbe {
    pub fn available() -> Self {
        Self {
            unavailable_reason: None,
        }
    }

    pub fn unavailable() -> Self {
        Self::unavailable_because("broker marked unavailable")
    }

    pub fn unavailable_because(reason: impl Into<String>) -> Self {
        Self {
            unavailable_reason: Some(reason.into()),
        }
    }
}

impl BrokerProbe for StaticBrokerProbe {
    fn check(&self) -> Result<(), BrokerUnavailableError> {
        match &self.unavailable_reason {
            None => Ok(()),
            Some(reason) => Err(BrokerUnavailableError(reason.clone())),
        }
    }
}

/// Answers a Redis `PING` on the configured URL.
#[cfg(feature = "redis")]
#[derive(Debug, Clone)]
pub struct RedisBrokerProbe {
    url: String,
}

#[cfg(feature = "redis")]
impl RedisBrokerProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[cfg(feature = "redis")]
impl BrokerProbe for RedisBrokerProbe {
    fn check(&self) -> Result<(), BrokerUnavailableError> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| BrokerUnavailableError(format!("invalid broker url: {e}")))?;
        let mut conn = client
            .get_connection()
            .map_err(|e| BrokerUnavailableError(format!("connection failed: {e}")))?;
        let pong: String = redis::cmd("PING")
            .query(&mut conn)
            .map_err(|e| BrokerUnavailableError(format!("PING failed: {e}")))?;
        debug!(url = %self.url, reply = %pong, "broker answered");
        Ok(())
    }
}

/// Probe matching the configuration.
///
/// No URL means the in-process worker pool is the broker. A URL can only be
/// verified when built with the `redis` feature; without it the broker is
/// reported unavailable.
pub fn probe_for(config: &LeadflowConfig) -> Box<dyn BrokerProbe> {
    match config.broker_url.as_deref() {
        None => Box::new(StaticBrokerProbe::available()),
        #[cfg(feature = "redis")]
        Some(url) => Box::new(RedisBrokerProbe::new(url)),
        #[cfg(not(feature = "redis"))]
        Some(url) => {
            debug!(url = %url, "redis support not compiled in");
            Box::new(StaticBrokerProbe::unavailable_because(format!(
                "cannot reach {url}: built without the redis feature"
            )))
        }
    }
}
