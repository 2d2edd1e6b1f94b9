use serde_derive::{Deserialize, Serialize};

use crate::error::{ConfigError, EngineError};
use crate::units::{UnitEntry, UnitTable};

/// Energy unit all totals are kept in.
pub const TARGET_UNIT: &str = "kWh";
/// Power unit incoming readings must be expressed in.
pub const SOURCE_UNIT: &str = "W";

/// Entity description as handed over by the registry.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub custom: Option<CustomSettings>,
}

/// Per-entity settings an operator attached to the entity.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub start_value: Option<f64>,
    #[serde(default)]
    pub end_value: Option<f64>,
}

impl EntityDescriptor {
    pub fn is_enabled(&self) -> bool {
        self.custom.as_ref().is_some_and(|custom| custom.enabled)
    }
}

/// Validated, immutable-at-runtime part of an entity's configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySettings {
    pub entity_id: String,
    /// Entity id with dots replaced, used as the parent of the entity's slots.
    pub device_name: String,
    pub display_name: String,
    pub source_unit: String,
    pub target_unit: String,
    pub source: UnitEntry,
    pub target: UnitEntry,
    pub start_threshold: Option<f64>,
    /// Carried for operators, not evaluated by the accumulation policy.
    pub end_threshold: Option<f64>,
}

impl EntitySettings {
    pub fn from_descriptor(
        descriptor: &EntityDescriptor,
        units: &UnitTable,
    ) -> Result<Self, EngineError> {
        let entity = descriptor.id.clone();
        let custom = match &descriptor.custom {
            Some(custom) if custom.enabled => custom,
            _ => return Err(ConfigError::Disabled { entity }.into()),
        };

        let source_unit = match descriptor.unit.as_deref() {
            Some(unit) if !unit.is_empty() => unit.to_string(),
            _ => return Err(ConfigError::MissingUnit { entity }.into()),
        };
        if source_unit != SOURCE_UNIT {
            return Err(ConfigError::UnsupportedUnit {
                entity,
                unit: source_unit,
            }
            .into());
        }

        let source = units.lookup(&entity, &source_unit)?;
        let target = units.lookup(&entity, TARGET_UNIT)?;

        let device_name = device_name(&entity);
        let display_name = if custom.alias.is_empty() {
            device_name.clone()
        } else {
            custom.alias.clone()
        };

        Ok(Self {
            entity_id: entity,
            device_name,
            display_name,
            source_unit,
            target_unit: TARGET_UNIT.to_string(),
            source,
            target,
            start_threshold: custom.start_value,
            end_threshold: custom.end_value,
        })
    }
}

/// Turns `sensor.washer.power` into `sensor_washer_power`.
pub fn device_name(entity_id: &str) -> String {
    entity_id.replace('.', "_")
}

/// Runtime memory of an entity, owned and mutated by the dispatcher only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalcMemory {
    pub previous_reading_watt: Option<f64>,
    pub previous_reading_ts: Option<i64>,
    /// Energy accumulated since the last reset, in the target unit.
    pub cumulative_value: f64,
    /// Live value last written to the temporary slot.
    pub temporary_value: f64,
    pub reset_active: bool,
}

impl CalcMemory {
    /// Memory seeded from previously persisted slot values.
    pub fn restored(temporary: Option<f64>, reset_active: Option<bool>) -> Self {
        let total = normalize_total(temporary.unwrap_or_default());
        Self {
            cumulative_value: total,
            temporary_value: total,
            reset_active: reset_active.unwrap_or_default(),
            ..Self::default()
        }
    }
}

/// Totals are finite and non-negative; anything else counts as zero.
pub fn normalize_total(value: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        0.0
    }
}

/// Everything the engine knows about one monitored entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityConfig {
    pub settings: EntitySettings,
    pub memory: CalcMemory,
}

impl EntityConfig {
    pub fn new(settings: EntitySettings, memory: CalcMemory) -> Self {
        Self { settings, memory }
    }
}
