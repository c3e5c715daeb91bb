// Device-level response buffers

use crate::status::{DevFlags, InstEnergy, SockFlags, Version};

/// Response for the GetState command
///
/// Offset  Length  Content
///      0       1  Run mode: 'B' == boot loader, appTag == application
///      1       1  Major version
///      2       1  Minor version
///      3       1  Patch version
#[derive(Default)]
pub struct StateRsp([u8; 4]);

impl StateRsp {
    pub const LEN: usize = 4;

    /// Create a new response buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the raw run-mode tag character
    pub fn mode_char(&self) -> u8 {
        self.0[0]
    }

    /// Return the firmware version
    pub fn version(&self) -> Version {
        Version::from_bytes(&self.0[1..4])
    }
}

impl AsMut<[u8]> for StateRsp {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Response for the GetStatus command
///
/// Offset  Length  Content
///      0       N  Socket status flags, one byte per socket, wire order
///      N       2  Temperature, degrees C, big-endian
///    N+2       4  Uptime in seconds, big-endian
///    N+6       1  Device flags (optional, absent on older firmware)
#[derive(Default)]
pub struct StatusRsp {
    buf: [u8; STATUS_RSP_MAX],
    len: usize,
    num_sockets: usize,
}

/// Largest supported status report: SOCK_MAX flag bytes, temperature,
/// uptime, and the device flag byte
const STATUS_RSP_MAX: usize = crate::config::SOCK_MAX + 7;

impl StatusRsp {
    pub const MAX_LEN: usize = STATUS_RSP_MAX;

    /// Create a new response buffer for the given socket count
    pub fn new(num_sockets: usize) -> Self {
        Self { num_sockets, ..Self::default() }
    }

    /// Record how many bytes the EMTR actually returned
    pub fn set_len(&mut self, len: usize) {
        self.len = len;
    }

    /// Smallest acceptable report for this socket count
    pub fn min_len(&self) -> usize {
        self.num_sockets + 6
    }

    /// Status flag byte of the wire record at `wire_idx`
    pub fn sock_flags(&self, wire_idx: usize) -> SockFlags {
        SockFlags(self.buf[wire_idx])
    }

    /// Temperature in degrees C
    pub fn temperature(&self) -> u16 {
        let at = self.num_sockets;
        u16::from_be_bytes([self.buf[at], self.buf[at + 1]])
    }

    /// Cumulative seconds the EMTR has been powered
    pub fn uptime(&self) -> u32 {
        let at = self.num_sockets + 2;
        u32::from_be_bytes([self.buf[at], self.buf[at + 1], self.buf[at + 2], self.buf[at + 3]])
    }

    /// Device flags, zero when the byte is absent from the report
    pub fn dev_flags(&self) -> DevFlags {
        let at = self.num_sockets + 6;
        if self.len > at {
            DevFlags(self.buf[at])
        } else {
            DevFlags(0)
        }
    }
}

impl AsMut<[u8]> for StatusRsp {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Response for the GetKWH command: one big-endian u32 per socket, wire order
#[derive(Default)]
pub struct KwhRsp([u8; 4 * crate::config::SOCK_MAX]);

impl KwhRsp {
    /// Exact report size for a socket count
    pub const fn len_for(num_sockets: usize) -> usize {
        4 * num_sockets
    }

    /// Create a new response buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Watt-hours of the wire record at `wire_idx`
    pub fn watt_hours(&self, wire_idx: usize) -> u32 {
        let at = wire_idx * 4;
        u32::from_be_bytes([self.0[at], self.0[at + 1], self.0[at + 2], self.0[at + 3]])
    }
}

impl AsMut<[u8]> for KwhRsp {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Response for the GetInstant command
///
/// Per socket, wire order: dVolts, mAmps, dWatts, pFactor, each a
/// big-endian u16.
#[derive(Default)]
pub struct InstantRsp([u8; 8 * crate::config::SOCK_MAX]);

impl InstantRsp {
    /// Exact report size for a socket count
    pub const fn len_for(num_sockets: usize) -> usize {
        8 * num_sockets
    }

    /// Create a new response buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Instant energy of the wire record at `wire_idx`
    pub fn energy(&self, wire_idx: usize) -> InstEnergy {
        let at = wire_idx * 8;
        let be16 = |i: usize| u16::from_be_bytes([self.0[i], self.0[i + 1]]);
        InstEnergy {
            d_volts: be16(at),
            m_amps: be16(at + 2),
            d_watts: be16(at + 4),
            p_factor: be16(at + 6),
        }
    }
}

impl AsMut<[u8]> for InstantRsp {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}
