use crate::entity::{normalize_total, CalcMemory, EntityConfig, EntitySettings};
use crate::error::EngineError;
use crate::integration::{advance, convert, IntegrationOutcome, Sample};
use crate::slots::{SlotKind, SlotWrite};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleKind {
    /// The cycle's energy went into the accumulator.
    Accumulated { delta: f64, total: f64 },
    /// The sample fell below the start threshold. `flushed` was persisted as the
    /// cumulative value, `discarded` is the energy of the reset sample itself.
    Reset { flushed: f64, discarded: f64 },
}

/// Result of one calculation cycle: the writes to perform, in order, and the
/// memory to commit once they succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub kind: CycleKind,
    pub writes: Vec<SlotWrite>,
    pub memory: CalcMemory,
}

/// A sample below a configured start threshold starts a new cycle.
/// Without a threshold the entity never resets on its own.
pub fn is_reset_event(settings: &EntitySettings, sample: Sample) -> bool {
    settings
        .start_threshold
        .is_some_and(|threshold| sample.value < threshold)
}

/// Runs integration and the reset policy for one sample without touching
/// `entity`. Any error leaves nothing to write.
pub fn apply(entity: &EntityConfig, sample: Sample) -> Result<Cycle, EngineError> {
    let settings = &entity.settings;
    let mut memory = entity.memory.clone();
    memory.cumulative_value = normalize_total(memory.cumulative_value);
    memory.temporary_value = normalize_total(memory.temporary_value);

    if is_reset_event(settings, sample) {
        // The reset sample's energy is dropped, so its sign doesn't matter
        let discarded = advance(settings, &mut memory, sample).value();
        let flushed = memory.cumulative_value;
        memory.cumulative_value = 0.0;
        memory.temporary_value = 0.0;
        memory.reset_active = true;
        // Temporary first: a failed flush then leaves the persisted total alone
        return Ok(Cycle {
            kind: CycleKind::Reset { flushed, discarded },
            writes: vec![
                SlotWrite::number(SlotKind::Temporary, 0.0),
                SlotWrite::number(SlotKind::Cumulative, flushed),
                SlotWrite::flag(SlotKind::ResetMode, true),
            ],
            memory,
        });
    }

    let outcome = convert(settings, &mut memory, sample)?;

    let total = match outcome {
        IntegrationOutcome::Accumulate(delta) => memory.cumulative_value + delta,
        IntegrationOutcome::Replace(value) => value,
    };
    if !total.is_finite() {
        return Err(EngineError::CalculationError {
            entity: settings.entity_id.clone(),
            detail: format!(
                "total {total} after adding {outcome:?} to {} from sample {sample:?}",
                memory.cumulative_value
            ),
        });
    }

    memory.cumulative_value = total;
    memory.temporary_value = total;
    let mut writes = vec![SlotWrite::number(SlotKind::Temporary, total)];
    if memory.reset_active {
        memory.reset_active = false;
        writes.push(SlotWrite::flag(SlotKind::ResetMode, false));
    }

    Ok(Cycle {
        kind: CycleKind::Accumulated {
            delta: outcome.value(),
            total,
        },
        writes,
        memory,
    })
}
