//! Delta Consumption Library
//!
//! Turns periodic power readings (W) of monitored entities into accumulated
//! energy (kWh). Totals are kept per entity, flushed into a persisted
//! consumption slot whenever a reading drops below the entity's start
//! threshold, and written back to an external state store.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod integration;
pub mod policy;
pub mod readiness;
pub mod rest_store;
pub mod sample_poller;
pub mod slots;
pub mod store;
pub mod units;

// Re-export commonly used types for easier access
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use dispatcher::Dispatcher;
pub use entity::{EntityConfig, EntityDescriptor};
pub use error::{ConfigError, EngineError};
pub use integration::{RawSample, Sample};
pub use slots::{SlotKind, SlotValue};
pub use store::{Event, InMemoryStore, Registry, StateStore, StaticRegistry};
pub use units::UnitTable;
