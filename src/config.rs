//! # Driver configuration
//!
//! Command codes vary slightly across EMTR firmware families, so every code
//! the driver sends arrives here rather than being baked in. The same goes
//! for the flag bit masks, the application-mode tag character, and the wire
//! ordering of per-socket records. A code of 0 marks a command the current
//! EMTR firmware does not support.

/// Maximum number of sockets the driver can manage
pub const SOCK_MAX: usize = 4;

/// Maximum number of accumulator channels per socket, including the
/// driver-internal load channel 0
pub const ACC_CHAN_MAX: usize = 4;

/// Per-socket command codes
#[derive(Debug, Clone, Copy, Default)]
pub struct SockCmdCodes {
    /// Turn on the relay
    pub turn_on: u8,
    /// Turn off the relay
    pub turn_off: u8,
    /// Read the power-signature timestamp
    pub sig_ts_read: u8,
    /// Read one power-signature page
    pub sig_page_read: u8,
    /// Read calibration data
    pub cal_get: u8,
    /// Store calibration data to flash
    pub cal_set: u8,
}

/// Identity and command codes for one socket
#[derive(Debug, Clone, Copy)]
pub struct SockInfo {
    /// Socket number, starting with 1
    pub sock_num: u8,
    pub cmd: SockCmdCodes,
}

/// Device-level command codes
#[derive(Debug, Clone, Copy, Default)]
pub struct DevCmdCodes {
    /// Query run mode and firmware version
    pub state_get: u8,
    /// Read device and socket status
    pub status_get: u8,
    /// Read cumulative watt-hours
    pub kwh_get: u8,
    /// Read instant energy
    pub instant_get: u8,
    /// Start an XMODEM firmware transfer (boot loader only)
    pub xmodem_start: u8,
}

/// Bit masks for the device flag byte of the status report
#[derive(Debug, Clone, Copy)]
pub struct DevFlagMasks {
    /// EMTR requests a factory reset of the host
    pub factory_reset: u8,
}

impl Default for DevFlagMasks {
    fn default() -> Self {
        Self { factory_reset: 1 << 0 }
    }
}

/// Bit masks for the per-socket flag bytes of the status report
#[derive(Debug, Clone, Copy)]
pub struct SockFlagMasks {
    pub relay_active: u8,
    pub plug_detect: u8,
    pub load_active: u8,
    pub overload: u8,
}

impl Default for SockFlagMasks {
    fn default() -> Self {
        Self {
            relay_active: 1 << 2,
            plug_detect: 1 << 3,
            load_active: 1 << 4,
            overload: 1 << 5,
        }
    }
}

/// Ordering of per-socket records inside multi-socket responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WireOrder {
    /// Socket N comes first on the wire (all known boards)
    #[default]
    Reversed,
    /// Socket 1 comes first on the wire
    Forward,
}

impl WireOrder {
    /// Map a record index on the wire to the 1-based socket number
    pub fn sock_num(&self, num_sockets: u8, wire_idx: usize) -> u8 {
        match self {
            WireOrder::Reversed => num_sockets - wire_idx as u8,
            WireOrder::Forward => wire_idx as u8 + 1,
        }
    }
}

/// EMTR driver configuration
///
/// Passed to [`Emtr::new`](crate::Emtr::new). The socket table and optional
/// firmware image must outlive the driver.
#[derive(Clone, Copy)]
pub struct Config {
    /// Mode tag character reported by the EMTR application (e.g. `b'E'`)
    pub app_tag: u8,
    /// Milliseconds to wait after releasing reset before the EMTR accepts
    /// commands (typically 100-110)
    pub reset_delay_ms: u16,
    /// Reserved
    pub comm_delay_ms: u32,
    /// Number of accumulator channels to allocate in addition to the
    /// driver-internal load channel
    pub num_acc_chan: u8,
    /// One entry per socket
    pub sockets: &'static [SockInfo],
    /// Device-level command codes
    pub cmd: DevCmdCodes,
    pub dev_flag: DevFlagMasks,
    pub sock_flag: SockFlagMasks,
    pub wire_order: WireOrder,
    /// Firmware image to program into the EMTR when its application fails
    /// to start
    pub fw_image: Option<&'static [u8]>,
}

impl Config {
    /// Create a configuration with default masks and reversed wire order
    pub fn new(app_tag: u8, cmd: DevCmdCodes, sockets: &'static [SockInfo]) -> Self {
        Self {
            app_tag,
            reset_delay_ms: 100,
            comm_delay_ms: 0,
            num_acc_chan: 0,
            sockets,
            cmd,
            dev_flag: DevFlagMasks::default(),
            sock_flag: SockFlagMasks::default(),
            wire_order: WireOrder::default(),
            fw_image: None,
        }
    }

    /// Update the number of application accumulator channels
    pub fn with_acc_chan(mut self, num: u8) -> Self {
        self.num_acc_chan = num;
        self
    }

    /// Attach a firmware image for recovery programming
    pub fn with_fw_image(mut self, image: &'static [u8]) -> Self {
        self.fw_image = Some(image);
        self
    }

    /// Number of sockets defined by the socket table
    pub fn num_sockets(&self) -> u8 {
        self.sockets.len() as u8
    }

    /// Check the configuration for internal consistency
    pub(crate) fn validate(&self) -> bool {
        !self.sockets.is_empty()
            && self.sockets.len() <= SOCK_MAX
            && (self.num_acc_chan as usize) < ACC_CHAN_MAX
            && self.cmd.state_get != 0
            && self.cmd.status_get != 0
    }
}
