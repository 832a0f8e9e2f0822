/// Holding registers of the charger that the proxy cares about.
/// Everything else is forwarded untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RegisterAddress {
    /// Write 1 to start (dis)charging, 2 to stop
    Action = 0x0101,
    /// Signed Watts, positive charges (imports), negative discharges (exports)
    PowerSetpoint = 0x0104,
    /// Measured AC active power, signed Watts
    AcActivePowerRms = 0x020e,
}

impl RegisterAddress {
    pub const fn addr(self) -> u16 {
        self as u16
    }

    pub fn from_addr(addr: u16) -> Option<Self> {
        match addr {
            0x0101 => Some(Self::Action),
            0x0104 => Some(Self::PowerSetpoint),
            0x020e => Some(Self::AcActivePowerRms),
            _ => None,
        }
    }
}

/// Values accepted by [`RegisterAddress::Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeAction {
    Start,
    Stop,
}

impl ChargeAction {
    pub fn from_word(word: u16) -> Option<Self> {
        match word {
            1 => Some(Self::Start),
            2 => Some(Self::Stop),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_match_charger_map() {
        assert_eq!(RegisterAddress::Action.addr(), 0x0101);
        assert_eq!(RegisterAddress::PowerSetpoint.addr(), 0x0104);
        assert_eq!(
            RegisterAddress::from_addr(0x0104),
            Some(RegisterAddress::PowerSetpoint)
        );
        assert_eq!(RegisterAddress::from_addr(0x0102), None);
    }

    #[test]
    fn action_words() {
        assert_eq!(ChargeAction::from_word(1), Some(ChargeAction::Start));
        assert_eq!(ChargeAction::from_word(2), Some(ChargeAction::Stop));
        assert_eq!(ChargeAction::from_word(3), None);
    }
}
