use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::EngineError;

/// Physical category a unit belongs to. Only units of the same category can be
/// scaled into each other by their exponents alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitCategory {
    Watt,
    WattHour,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitEntry {
    pub exponent: i32,
    pub category: UnitCategory,
}

// (symbol, power-of-ten exponent, category)
const ELECTRICITY_UNITS: [(&str, i32, UnitCategory); 10] = [
    ("mW", -3, UnitCategory::Watt),
    ("W", 0, UnitCategory::Watt),
    ("kW", 3, UnitCategory::Watt),
    ("MW", 6, UnitCategory::Watt),
    ("GW", 9, UnitCategory::Watt),
    ("mWh", -3, UnitCategory::WattHour),
    ("Wh", 0, UnitCategory::WattHour),
    ("kWh", 3, UnitCategory::WattHour),
    ("MWh", 6, UnitCategory::WattHour),
    ("GWh", 9, UnitCategory::WattHour),
];

/// Read-only mapping from unit symbol to exponent and category.
#[derive(Debug)]
pub struct UnitTable {
    entries: HashMap<&'static str, UnitEntry>,
}

static UNIT_TABLE: OnceLock<UnitTable> = OnceLock::new();

impl UnitTable {
    fn load() -> Self {
        let entries = ELECTRICITY_UNITS
            .iter()
            .map(|&(symbol, exponent, category)| (symbol, UnitEntry { exponent, category }))
            .collect();
        Self { entries }
    }

    /// Process-wide table, built on first access.
    pub fn global() -> &'static UnitTable {
        UNIT_TABLE.get_or_init(Self::load)
    }

    pub fn lookup(&self, entity_id: &str, unit: &str) -> Result<UnitEntry, EngineError> {
        self.entries
            .get(unit)
            .copied()
            .ok_or_else(|| EngineError::UnknownUnit {
                entity: entity_id.to_string(),
                unit: unit.to_string(),
            })
    }

    /// Known unit symbols, sorted by category and then by exponent.
    pub fn symbols(&self) -> Vec<&'static str> {
        let mut symbols: Vec<_> = self.entries.iter().collect();
        symbols.sort_by_key(|(_, entry)| (entry.category == UnitCategory::WattHour, entry.exponent));
        symbols.into_iter().map(|(symbol, _)| *symbol).collect()
    }
}

/// Factor that turns a value expressed in `source` into one expressed in `target`.
pub fn exponent_factor(source: UnitEntry, target: UnitEntry) -> f64 {
    10f64.powi(source.exponent - target.exponent)
}
