//! Resource URL composition.
//!
//! Every controller, device, instrument, and view is named by a URL built from
//! its parent's URL:
//!
//! | Resource   | Form                         | Example                              |
//! |------------|------------------------------|--------------------------------------|
//! | controller | `controllerType://relative`  | `gpib://board0`                      |
//! | device     | `controllerUrl#busAddress`   | `gpib://board0#7`                    |
//! | instrument | `instrumentType@deviceUrl`   | `tds3000@gpib://board0#7`            |
//! | view       | `viewType<>instrumentUrl`    | `waveform<>tds3000@gpib://board0#7`  |
//!
//! Only composition lives here; resolving URLs to objects is the job of an
//! external registry.

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest primary address on an IEEE-488 bus.
pub const MAX_PRIMARY_ADDRESS: u8 = 30;

/// Address of a device on a controller's bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusAddress {
    primary: u8,
    secondary: Option<u8>,
}

impl BusAddress {
    /// Primary address in `0..=30`.
    pub fn new(primary: u8) -> RuntimeResult<Self> {
        if primary > MAX_PRIMARY_ADDRESS {
            return Err(RuntimeError::InvalidConfig(format!(
                "bus address {primary} out of range 0..={MAX_PRIMARY_ADDRESS}"
            )));
        }
        Ok(Self {
            primary,
            secondary: None,
        })
    }

    /// Add a secondary address in `0..=30`.
    pub fn with_secondary(mut self, secondary: u8) -> RuntimeResult<Self> {
        if secondary > MAX_PRIMARY_ADDRESS {
            return Err(RuntimeError::InvalidConfig(format!(
                "secondary address {secondary} out of range 0..={MAX_PRIMARY_ADDRESS}"
            )));
        }
        self.secondary = Some(secondary);
        Ok(self)
    }

    /// Primary address.
    pub fn primary(&self) -> u8 {
        self.primary
    }

    /// Secondary address, if any.
    pub fn secondary(&self) -> Option<u8> {
        self.secondary
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.secondary {
            Some(secondary) => write!(f, "{}.{}", self.primary, secondary),
            None => write!(f, "{}", self.primary),
        }
    }
}

/// `type://relative`
pub fn controller_url(controller_type: &str, relative_url: &str) -> String {
    format!("{controller_type}://{relative_url}")
}

/// `controller#address`
pub fn device_url(controller_url: &str, address: BusAddress) -> String {
    format!("{controller_url}#{address}")
}

/// `type@device`
pub fn instrument_url(instrument_type: &str, device_url: &str) -> String {
    format!("{instrument_type}@{device_url}")
}

/// `type<>instrument`
pub fn view_url(view_type: &str, instrument_url: &str) -> String {
    format!("{view_type}<>{instrument_url}")
}
