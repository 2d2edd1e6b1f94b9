use std::fmt;

/// Persisted value slots kept per entity in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Cumulative,
    Temporary,
    ResetMode,
}

struct SlotNames {
    state_name: &'static str,
    object_suffix: &'static str,
    description: &'static str,
}

const CUMULATIVE_NAMES: SlotNames = SlotNames {
    state_name: "consumption.dataValue",
    object_suffix: "consumption",
    description: "Consumption",
};

const TEMPORARY_NAMES: SlotNames = SlotNames {
    state_name: "consumption.tempValue",
    object_suffix: "consumption_temp",
    description: "Temporary Value",
};

const RESET_MODE_NAMES: SlotNames = SlotNames {
    state_name: "consumption.calcMode",
    object_suffix: "consumption_calc_mode",
    description: "Calculation-Mode",
};

impl SlotKind {
    pub const ALL: [SlotKind; 3] = [SlotKind::Cumulative, SlotKind::Temporary, SlotKind::ResetMode];

    fn names(self) -> &'static SlotNames {
        match self {
            SlotKind::Cumulative => &CUMULATIVE_NAMES,
            SlotKind::Temporary => &TEMPORARY_NAMES,
            SlotKind::ResetMode => &RESET_MODE_NAMES,
        }
    }

    /// Dotted state name below the entity's device, e.g. `consumption.tempValue`.
    pub fn state_name(self) -> &'static str {
        self.names().state_name
    }

    /// Flat suffix for stores that don't allow dots inside object ids.
    pub fn object_suffix(self) -> &'static str {
        self.names().object_suffix
    }

    pub fn description(self) -> &'static str {
        self.names().description
    }

    pub fn is_flag(self) -> bool {
        self == SlotKind::ResetMode
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotValue {
    Number(f64),
    Flag(bool),
}

impl SlotValue {
    pub fn as_number(self) -> Option<f64> {
        match self {
            SlotValue::Number(value) => Some(value),
            SlotValue::Flag(_) => None,
        }
    }

    pub fn as_flag(self) -> Option<bool> {
        match self {
            SlotValue::Flag(flag) => Some(flag),
            SlotValue::Number(_) => None,
        }
    }
}

impl fmt::Display for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotValue::Number(value) => write!(f, "{value}"),
            SlotValue::Flag(flag) => write!(f, "{flag}"),
        }
    }
}

/// A single write the policy asks the dispatcher to perform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotWrite {
    pub slot: SlotKind,
    pub value: SlotValue,
}

impl SlotWrite {
    pub fn number(slot: SlotKind, value: f64) -> Self {
        Self {
            slot,
            value: SlotValue::Number(value),
        }
    }

    pub fn flag(slot: SlotKind, flag: bool) -> Self {
        Self {
            slot,
            value: SlotValue::Flag(flag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_names() {
        assert_eq!(SlotKind::Cumulative.state_name(), "consumption.dataValue");
        assert_eq!(SlotKind::Temporary.state_name(), "consumption.tempValue");
        assert_eq!(SlotKind::ResetMode.state_name(), "consumption.calcMode");
        assert_eq!(SlotKind::ResetMode.description(), "Calculation-Mode");
        assert_eq!(SlotKind::Temporary.object_suffix(), "consumption_temp");
    }

    #[test]
    fn test_every_slot_has_distinct_names() {
        for a in SlotKind::ALL {
            for b in SlotKind::ALL {
                if a != b {
                    assert_ne!(a.state_name(), b.state_name());
                    assert_ne!(a.object_suffix(), b.object_suffix());
                }
            }
        }
    }

    #[test]
    fn test_slot_value_accessors() {
        assert!(SlotKind::ResetMode.is_flag());
        assert!(!SlotKind::Cumulative.is_flag());
        assert_eq!(SlotValue::Number(0.5).as_flag(), None);
        assert_eq!(SlotValue::Flag(true).to_string(), "true");
    }
}
