use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{CalcMemory, EntitySettings};
use crate::error::EngineError;
use crate::units::{exponent_factor, UnitCategory};

const MS_PER_HOUR: f64 = 3_600_000.0;

/// A sample as the state store delivers it: an untyped value and its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub value: Value,
    pub timestamp_ms: i64,
}

impl RawSample {
    pub fn new(value: impl Into<Value>, timestamp_ms: i64) -> Self {
        Self {
            value: value.into(),
            timestamp_ms,
        }
    }
}

/// A validated reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp_ms: i64,
}

impl Sample {
    /// Accepts JSON numbers and numeric strings. Readings must be finite;
    /// negative readings (e.g. standby draw) pass and are left to the policy.
    pub fn parse(entity_id: &str, raw: &RawSample) -> Result<Self, EngineError> {
        let invalid = |reason| EngineError::InvalidSample {
            entity: entity_id.to_string(),
            value: raw.value.to_string(),
            reason,
        };

        let value = match &raw.value {
            Value::Number(number) => number.as_f64().ok_or_else(|| invalid("not a number"))?,
            Value::String(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid("not a number"))?,
            _ => return Err(invalid("not a number")),
        };
        if !value.is_finite() {
            return Err(invalid("not finite"));
        }

        Ok(Self {
            value,
            timestamp_ms: raw.timestamp_ms,
        })
    }
}

/// How a cycle's converted value combines with the running total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntegrationOutcome {
    /// Energy integrated from a power reading, to be added to the accumulator.
    Accumulate(f64),
    /// A reading that already is energy; it replaces the running value.
    Replace(f64),
}

impl IntegrationOutcome {
    pub fn value(self) -> f64 {
        match self {
            IntegrationOutcome::Accumulate(value) | IntegrationOutcome::Replace(value) => value,
        }
    }
}

/// Energy since the previous sample, holding the previous power level constant
/// over the elapsed interval. The baseline always moves to `sample`.
///
/// Returns 0 when there is no previous reading yet. A negative previous reading
/// is held as zero draw.
pub fn integrate(memory: &mut CalcMemory, sample: Sample) -> f64 {
    let delta = match (memory.previous_reading_watt, memory.previous_reading_ts) {
        (Some(previous_watt), Some(previous_ts)) => {
            // f64 keeps extreme timestamp gaps from overflowing
            let elapsed_ms = sample.timestamp_ms as f64 - previous_ts as f64;
            elapsed_ms * previous_watt.max(0.0) / MS_PER_HOUR
        }
        _ => 0.0,
    };
    memory.previous_reading_watt = Some(sample.value);
    memory.previous_reading_ts = Some(sample.timestamp_ms);
    delta
}

/// Rescales `value` from the entity's source unit to its target unit.
pub fn scale(settings: &EntitySettings, value: f64) -> f64 {
    value * exponent_factor(settings.source, settings.target)
}

/// Moves the baseline to `sample` and returns this cycle's energy in the
/// target unit, unchecked. Used as is where the value gets discarded.
pub fn advance(settings: &EntitySettings, memory: &mut CalcMemory, sample: Sample) -> IntegrationOutcome {
    match settings.source.category {
        UnitCategory::Watt => IntegrationOutcome::Accumulate(scale(settings, integrate(memory, sample))),
        UnitCategory::WattHour => {
            memory.previous_reading_watt = Some(sample.value);
            memory.previous_reading_ts = Some(sample.timestamp_ms);
            IntegrationOutcome::Replace(scale(settings, sample.value))
        }
    }
}

/// Turns a sample into the energy value of this cycle, in the target unit.
///
/// `memory` is the working copy of the entity's memory; its baseline is
/// advanced even when the returned value is rejected, so callers must only
/// commit it once the whole cycle succeeded.
pub fn convert(
    settings: &EntitySettings,
    memory: &mut CalcMemory,
    sample: Sample,
) -> Result<IntegrationOutcome, EngineError> {
    let previous_ts = memory.previous_reading_ts;
    let outcome = advance(settings, memory, sample);

    let value = outcome.value();
    if !value.is_finite() {
        return Err(EngineError::CalculationError {
            entity: settings.entity_id.clone(),
            detail: format!(
                "non-finite energy {value} from sample {sample:?} ({} -> {})",
                settings.source_unit, settings.target_unit
            ),
        });
    }
    if value < 0.0 {
        return Err(EngineError::CalculationError {
            entity: settings.entity_id.clone(),
            detail: format!(
                "negative energy {value} from sample {sample:?}, previous timestamp {previous_ts:?}"
            ),
        });
    }
    Ok(outcome)
}
