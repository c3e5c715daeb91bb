//! # Device and socket status
//!
//! Decoded views of the EMTR status reports. The driver keeps one
//! [`DeviceStatus`] plus one [`SockStatus`] per socket, refreshed by the poll
//! loop, and hands copies of them to API callers. Flag bytes coming off the
//! wire are wrapped in [`SockFlags`]/[`DevFlags`] so bit positions stay in
//! one place (the masks are configurable, see
//! [`SockFlagMasks`](crate::config::SockFlagMasks)).

use core::fmt;

/// EMTR run modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunMode {
    /// EMTR not started or in an unknown state
    NotRunning,
    /// EMTR application firmware is executing
    Application,
    /// EMTR boot loader is executing, ready for a firmware transfer
    BootLoader,
}

/// Firmware version triplet, formatted as `major.minor.patch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    /// Placeholder version reported until the EMTR has been queried
    pub const ZERO: Version = Version { major: 0, minor: 0, patch: 0 };

    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        Self {
            major: *b.first().unwrap_or(&0),
            minor: *b.get(1).unwrap_or(&0),
            patch: *b.get(2).unwrap_or(&0),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Instant energy measurements for one socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InstEnergy {
    /// Units of 0.1 Volts
    pub d_volts: u16,
    /// Units of 0.001 Amps
    pub m_amps: u16,
    /// Units of 0.1 Watts
    pub d_watts: u16,
    /// Power factor ratio 0..100
    pub p_factor: u16,
}

/// Device-level status snapshot
///
/// `comm_up` and `reset_count` are maintained by the driver; the rest is read
/// from the EMTR on each poll cycle.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceStatus {
    /// True while EMTR communication is healthy. When false the other
    /// fields hold the last good values.
    pub comm_up: bool,
    /// Number of hard resets issued to the EMTR since boot
    pub reset_count: u32,
    /// Degrees C
    pub temperature: u16,
    /// Cumulative seconds the EMTR has been powered
    pub uptime: u32,
    /// Raw device flag byte from the last status report
    pub flags: u8,
}

/// Socket-level status snapshot
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SockStatus {
    /// Plug detected in the receptacle
    pub plug_detected: bool,
    /// Present active/inactive state of the relay
    pub relay_active: bool,
    /// Seconds since the relay last changed state
    pub relay_time: u32,
    /// Present active/inactive state of the load
    pub load_active: bool,
    /// Seconds since the load last changed state
    pub load_time: u32,
    /// True while the socket is in overload
    pub overload: bool,
    /// Instant energy values
    pub inst_energy: InstEnergy,
    /// Cumulative units of 0.1 Watt-Hours
    pub d_watt_hours: u64,
}

/// One socket's status flag byte as read from the wire
#[derive(Debug, Clone, Copy, Default)]
pub struct SockFlags(pub u8);

impl SockFlags {
    pub fn contains(&self, mask: u8) -> bool {
        self.0 & mask != 0
    }
}

/// Device flag byte as read from the wire
#[derive(Debug, Clone, Copy, Default)]
pub struct DevFlags(pub u8);

impl DevFlags {
    pub fn contains(&self, mask: u8) -> bool {
        self.0 & mask != 0
    }
}

/// Min/max/average values for one measurement over an accumulator window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AvgEnergy {
    pub min: u32,
    pub max: u32,
    pub avg: u32,
    pub sample_count: u32,
}

/// Accumulated values for all four measurements of one channel
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AccEnergy {
    pub d_volts: AvgEnergy,
    pub m_amps: AvgEnergy,
    pub d_watts: AvgEnergy,
    pub p_factor: AvgEnergy,
}
