use thiserror::Error;

use crate::slots::SlotKind;

/// Problems with an entity's configuration. The entity is not initialised.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration found for {entity}")]
    NotFound { entity: String },
    #[error("{entity} is not enabled for consumption tracking")]
    Disabled { entity: String },
    #[error("no unit configured for {entity}")]
    MissingUnit { entity: String },
    #[error("unit {unit:?} of {entity} is not supported, only \"W\" is allowed")]
    UnsupportedUnit { entity: String, unit: String },
}

/// Errors scoped to a single entity or a single calculation cycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown unit {unit:?} for {entity}")]
    UnknownUnit { entity: String, unit: String },
    #[error("invalid sample for {entity}: {reason} (value {value})")]
    InvalidSample {
        entity: String,
        value: String,
        reason: &'static str,
    },
    #[error("calculation for {entity} failed: {detail}")]
    CalculationError { entity: String, detail: String },
    #[error("writing {slot} for {entity} failed: {source}")]
    StoreWriteFailure {
        entity: String,
        slot: SlotKind,
        #[source]
        source: anyhow::Error,
    },
    #[error("subscribing to {entity} failed: {source}")]
    Subscription {
        entity: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Configuration defects and lost subscriptions take the entity out of
    /// service; everything else only costs the current cycle.
    pub fn disables_entity(&self) -> bool {
        matches!(
            self,
            Self::UnknownUnit { .. } | Self::Subscription { .. } | Self::Config(_)
        )
    }
}
