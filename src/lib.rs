//! # EMTR energy-meter co-processor driver
//!
//! The EMTR is an auxiliary microcontroller found in networked smart-outlet
//! devices. It owns the relays, meters voltage/current/power per socket, and
//! reports device-wide health over a half-duplex serial link. This driver
//! speaks its framed command protocol, keeps a debounced cache of socket and
//! device state fresh with a 10 Hz poll loop, and can re-program the EMTR
//! firmware through its boot loader.
//!
//! ## Hardware interface
//!
//! Three pieces of hardware are borrowed from the board support layer:
//!
//! - the UART connected to the EMTR, as split or combined halves of
//!   [`embedded_io_async::Read`] + [`embedded_io_async::ReadReady`] +
//!   [`embedded_io_async::Write`]
//! - the EMTR reset line, an active-low [`OutputPin`]
//! - the UART TX pin's alternate-function control, wrapped in a
//!   [`TxSelectPin`]: the EMTR samples this line while leaving reset to pick
//!   between its application and its boot loader
//!
//! ## Usage
//!
//! ```ignore
//! static DRIVER: StaticCell<Emtr<Uart, ResetPin, TxSel>> = StaticCell::new();
//!
//! let driver = DRIVER.init(Emtr::new(uart, reset, tx_sel, conf));
//! driver.init().await?;
//! driver.start()?;
//! spawner.spawn(poll_task(driver))?;   // task body: driver.run().await
//!
//! driver.set_relay(1, true).await?;
//! let status = driver.sock_status(1).await?;
//! ```
//!
//! All public entry points share one async mutex, so API calls serialize
//! with the poll loop and with each other. Events (debounced state changes,
//! link up/down, factory-reset requests) are delivered by value through
//! [`next_event`](Emtr::next_event) and, optionally, a synchronous hook.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_time::Instant;
use embedded_hal::digital::OutputPin;
use embedded_io_async::{Read, ReadReady, Write};
use heapless::Vec;

pub mod acc;
pub mod cmd;
pub mod config;
pub mod event;
pub mod frame;
pub mod fw;
mod link;
mod poll;
mod runmode;
pub mod sock;
pub mod status;
pub mod xmodem;

pub use config::{Config, DevCmdCodes, DevFlagMasks, SockCmdCodes, SockFlagMasks, SockInfo, WireOrder};
pub use event::{Event, EventFn};
pub use link::CmdOptions;
pub use status::{AccEnergy, AvgEnergy, DeviceStatus, InstEnergy, RunMode, SockStatus, Version};

use cmd::cmd_socket::{sig_page_payload, SigPageRsp, SigTsRsp, SIG_PAGE_MAX, SIG_PAGE_SZ};
use event::{EventSink, EVT_QUEUE_SZ};
use poll::Msg;
use sock::SockCtrl;

/// Depth of the poll-loop control queue
const MSG_QUEUE_SZ: usize = 16;

/// Smallest buffer accepted by [`Emtr::cal_data`]
const CAL_DATA_SZ: usize = 128;

/// Errors returned by the EMTR driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EmtrError {
    /// Out-of-range socket or channel number, undersized buffer, or bad
    /// configuration
    InvalidArg,
    /// Driver not initialized, not running, or EMTR in the wrong mode
    BadState,
    /// Storage for driver state could not be allocated
    NoMem,
    /// Serial read exceeded its deadline
    Timeout,
    /// Underlying serial transport failed
    Io,
    /// A GPIO operation failed
    Pin,
    /// SOP, CMD, checksum, or length mismatch on a response
    BadFrame,
    /// Command retries exhausted; communication with the EMTR is down
    Link,
    /// Firmware image failed validation
    BadCrc,
}

/// Control over the UART TX pin during an EMTR reset
///
/// While the EMTR is held in reset, its firmware-select input (the host's
/// UART TX line) must be driven as a plain GPIO. How a pin is detached from
/// and re-attached to the UART peripheral is board-specific, so the driver
/// delegates it to this trait.
pub trait TxSelectPin {
    type Error;

    /// Detach TX from the UART and drive it to `level`
    fn drive(&mut self, level: bool) -> Result<(), Self::Error>;

    /// Return the pin to the UART peripheral
    fn release(&mut self) -> Result<(), Self::Error>;
}

/// Mutex-protected driver state: the serial port, both pins, and every
/// cached value the poll loop maintains
pub(crate) struct Inner<U, R, S> {
    pub(crate) uart: U,
    pub(crate) reset_pin: R,
    pub(crate) tx_sel: S,
    pub(crate) conf: Config,
    pub(crate) run_mode: RunMode,
    pub(crate) bl_version: Version,
    pub(crate) fw_version: Version,
    pub(crate) device: DeviceStatus,
    pub(crate) sockets: Vec<SockCtrl, { config::SOCK_MAX }>,
    /// Total accumulator channels per socket, load channel included
    pub(crate) num_acc_chan: usize,
    /// Delay the next command while the EMTR samples a relay transition
    pub(crate) hold_off_command: bool,
    pub(crate) pause: bool,
    pub(crate) poll_sample_ct: u32,
}

impl<U, R, S> Inner<U, R, S> {
    pub(crate) fn sock(&self, sock_num: u8) -> Option<&SockCtrl> {
        self.sockets.iter().find(|s| s.info.sock_num == sock_num)
    }

    pub(crate) fn sock_mut(&mut self, sock_num: u8) -> Option<&mut SockCtrl> {
        self.sockets.iter_mut().find(|s| s.info.sock_num == sock_num)
    }
}

/// EMTR driver handle
///
/// Create one per EMTR, park it somewhere `'static`, call
/// [`init`](Self::init) and [`start`](Self::start), and give
/// [`run`](Self::run) its own task.
pub struct Emtr<U, R, S> {
    inner: Mutex<CriticalSectionRawMutex, Inner<U, R, S>>,
    queue: Channel<CriticalSectionRawMutex, Msg, MSG_QUEUE_SZ>,
    events: Channel<CriticalSectionRawMutex, Event, EVT_QUEUE_SZ>,
    event_fn: Option<EventFn>,
    good: AtomicBool,
    running: AtomicBool,
    pub(crate) timer_stopped: AtomicBool,
}

impl<U, R, S> Emtr<U, R, S>
where
    U: Read + ReadReady + Write,
    R: OutputPin,
    S: TxSelectPin,
{
    /// Create the driver around its hardware resources
    ///
    /// The EMTR is not touched until [`init`](Self::init).
    pub fn new(uart: U, reset_pin: R, tx_sel: S, conf: Config) -> Self {
        Self {
            inner: Mutex::new(Inner {
                uart,
                reset_pin,
                tx_sel,
                conf,
                run_mode: RunMode::NotRunning,
                bl_version: Version::ZERO,
                fw_version: Version::ZERO,
                device: DeviceStatus::default(),
                sockets: Vec::new(),
                num_acc_chan: 1 + conf.num_acc_chan as usize,
                hold_off_command: false,
                pause: false,
                poll_sample_ct: 0,
            }),
            queue: Channel::new(),
            events: Channel::new(),
            event_fn: None,
            good: AtomicBool::new(false),
            running: AtomicBool::new(false),
            timer_stopped: AtomicBool::new(false),
        }
    }

    /// Install a synchronous event hook
    ///
    /// The hook runs with the driver lock held: keep it short and never
    /// block. Most applications are better served by
    /// [`next_event`](Self::next_event).
    pub fn with_event_fn(mut self, event_fn: EventFn) -> Self {
        self.event_fn = Some(event_fn);
        self
    }

    pub(crate) fn sink(&self) -> EventSink<'_> {
        EventSink { hook: self.event_fn, queue: &self.events }
    }

    fn check_request(&self) -> Result<(), EmtrError> {
        if !self.good.load(Ordering::Relaxed) || !self.running.load(Ordering::Relaxed) {
            return Err(EmtrError::BadState);
        }
        Ok(())
    }

    /// Probe the EMTR and prepare the driver
    ///
    /// Starts the boot loader and reads its version, then starts the
    /// application and reads its version. When the application does not
    /// come up and a firmware image was configured, the image is programmed
    /// through the boot loader before giving up on the part.
    pub async fn init(&self) -> Result<(), EmtrError> {
        if self.good.load(Ordering::Relaxed) {
            return Ok(());
        }

        let evt = self.sink();
        let mut inner = self.inner.lock().await;

        if !inner.conf.validate() {
            return Err(EmtrError::InvalidArg);
        }

        inner.sockets.clear();
        let num_acc_chan = inner.num_acc_chan;
        let infos = inner.conf.sockets;
        for info in infos {
            let sock = SockCtrl::new(*info, num_acc_chan);
            inner.sockets.push(sock).map_err(|_| EmtrError::NoMem)?;
        }

        // Start with the boot loader so its version is known even when the
        // application image is broken
        inner.bl_version = inner.run_mode_set(&evt, RunMode::BootLoader).await?;

        match inner.run_mode_set(&evt, RunMode::Application).await {
            Ok(version) => inner.fw_version = version,
            Err(_e) => {
                // The application may be missing or corrupt; recovery below
                // can still program a fresh image through the boot loader
                #[cfg(feature = "defmt")]
                defmt::warn!("EMTR application failed to start: {}", _e);
            }
        }

        if let Some(image) = inner.conf.fw_image {
            if let Ok(hdr) = fw::check_image(image, &fw::FW_TYPE_EMTR) {
                if inner.fw_version == Version::ZERO {
                    match inner.upgrade(&evt, image, &hdr).await {
                        Ok(()) => {
                            #[cfg(feature = "defmt")]
                            defmt::info!("EMTR firmware programmed: {}", inner.fw_version);
                        }
                        Err(_e) => {
                            #[cfg(feature = "defmt")]
                            defmt::warn!("EMTR firmware programming failed: {}", _e);
                        }
                    }
                }
            }
        }

        self.good.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Allow the poll loop to tick
    pub fn start(&self) -> Result<(), EmtrError> {
        if !self.good.load(Ordering::Relaxed) || self.running.swap(true, Ordering::Relaxed) {
            return Err(EmtrError::BadState);
        }
        self.timer_stopped.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Stop the poll loop and retire [`run`](Self::run)
    pub async fn stop(&self) -> Result<(), EmtrError> {
        if !self.running.swap(false, Ordering::Relaxed) {
            return Err(EmtrError::BadState);
        }
        self.queue.send(Msg::Stop).await;
        Ok(())
    }

    /// True while the driver is initialized and polling
    pub fn is_running(&self) -> bool {
        self.good.load(Ordering::Relaxed) && self.running.load(Ordering::Relaxed)
    }

    /// Suspend energy sampling; status polling and debounce continue
    pub async fn pause(&self) {
        self.queue.send(Msg::Pause).await;
    }

    /// Resume energy sampling
    pub async fn resume(&self) {
        self.queue.send(Msg::Resume).await;
    }

    /// Receive the next driver event
    pub async fn next_event(&self) -> Event {
        self.events.receive().await
    }

    /// Receive a driver event without waiting
    pub fn try_next_event(&self) -> Option<Event> {
        self.events.try_receive().ok()
    }

    /// EMTR boot loader version, valid after [`init`](Self::init)
    pub async fn bl_version(&self) -> Version {
        self.inner.lock().await.bl_version
    }

    /// EMTR application firmware version, valid after [`init`](Self::init)
    pub async fn fw_version(&self) -> Version {
        self.inner.lock().await.fw_version
    }

    /// Which EMTR image is currently executing
    pub async fn run_mode(&self) -> RunMode {
        self.inner.lock().await.run_mode
    }

    /// Copy of the device-level status
    pub async fn device_status(&self) -> Result<DeviceStatus, EmtrError> {
        self.check_request()?;
        Ok(self.inner.lock().await.device)
    }

    /// Copy of one socket's status, with the relay/load hold times
    /// computed against the current time
    pub async fn sock_status(&self, sock_num: u8) -> Result<SockStatus, EmtrError> {
        self.check_request()?;
        let now_s = Instant::now().as_secs() as u32;

        let inner = self.inner.lock().await;
        let sock = inner.sock(sock_num).ok_or(EmtrError::InvalidArg)?;

        let mut status = sock.status;
        status.relay_time = now_s.saturating_sub(sock.cos_time_relay);
        status.load_time = now_s.saturating_sub(sock.cos_time_load);
        Ok(status)
    }

    /// Snapshot one accumulator channel, optionally resetting it
    pub async fn read_accumulator(
        &self,
        sock_num: u8,
        chan: u8,
        reset: bool,
    ) -> Result<AccEnergy, EmtrError> {
        self.check_request()?;

        let mut inner = self.inner.lock().await;
        if usize::from(chan) >= inner.num_acc_chan {
            return Err(EmtrError::InvalidArg);
        }
        let sock = inner.sock_mut(sock_num).ok_or(EmtrError::InvalidArg)?;

        let acc = &mut sock.acc[usize::from(chan)];
        let snapshot = acc.snapshot();
        if reset {
            acc.clear();
        }
        Ok(snapshot)
    }

    /// Reset one accumulator channel without reading it
    pub async fn reset_accumulator(&self, sock_num: u8, chan: u8) -> Result<(), EmtrError> {
        self.check_request()?;

        let mut inner = self.inner.lock().await;
        if usize::from(chan) >= inner.num_acc_chan {
            return Err(EmtrError::InvalidArg);
        }
        let sock = inner.sock_mut(sock_num).ok_or(EmtrError::InvalidArg)?;
        sock.acc[usize::from(chan)].clear();
        Ok(())
    }

    /// Turn the socket's relay on or off
    ///
    /// The cached state converges via the poll loop once the EMTR reports
    /// the transition, so calling this twice with the same value is
    /// harmless.
    pub async fn set_relay(&self, sock_num: u8, active: bool) -> Result<(), EmtrError> {
        self.check_request()?;
        let evt = self.sink();

        let mut inner = self.inner.lock().await;
        let sock = inner.sock(sock_num).ok_or(EmtrError::InvalidArg)?;
        let code = if active { sock.info.cmd.turn_on } else { sock.info.cmd.turn_off };

        let opt = CmdOptions::default();
        inner.do_command(&evt, code, None, None, &opt).await?;
        Ok(())
    }

    /// Cached relay state; `false` for a bad socket number or while the
    /// driver lock is contended
    pub fn relay_is_active(&self, sock_num: u8) -> bool {
        self.check_request().is_ok()
            && self
                .inner
                .try_lock()
                .map(|inner| inner.sock(sock_num).map(|s| s.status.relay_active).unwrap_or(false))
                .unwrap_or(false)
    }

    /// Cached load state; `false` for a bad socket number or while the
    /// driver lock is contended
    pub fn load_is_active(&self, sock_num: u8) -> bool {
        self.check_request().is_ok()
            && self
                .inner
                .try_lock()
                .map(|inner| inner.sock(sock_num).map(|s| s.status.load_active).unwrap_or(false))
                .unwrap_or(false)
    }

    /// Send a raw command to the EMTR and optionally read back data
    ///
    /// Returns the number of payload bytes copied into `ret`. Without a
    /// return buffer the EMTR must answer with the generic acknowledge.
    pub async fn command(
        &self,
        cmd: u8,
        payload: Option<&[u8; 4]>,
        ret: Option<&mut [u8]>,
        opt: &CmdOptions,
    ) -> Result<usize, EmtrError> {
        self.check_request()?;
        let evt = self.sink();

        let mut inner = self.inner.lock().await;
        inner.do_command(&evt, cmd, payload, ret, opt).await
    }

    /// When and why the socket last captured a power signature
    pub async fn read_signature_timestamp(&self, sock_num: u8) -> Result<(u32, u8), EmtrError> {
        self.check_request()?;
        let evt = self.sink();

        let mut inner = self.inner.lock().await;
        let sock = inner.sock(sock_num).ok_or(EmtrError::InvalidArg)?;
        let code = sock.info.cmd.sig_ts_read;

        let mut rsp = SigTsRsp::new();
        let opt = CmdOptions::default();
        let len = inner.do_command(&evt, code, None, Some(rsp.as_mut()), &opt).await?;
        if len != SigTsRsp::LEN {
            return Err(EmtrError::BadFrame);
        }
        Ok((rsp.timestamp(), rsp.reason()))
    }

    /// Read one page of the socket's power signature
    ///
    /// Returns the capture timestamp; the page data lands in `buf`.
    pub async fn read_signature_page(
        &self,
        sock_num: u8,
        page: u8,
        buf: &mut [u8; SIG_PAGE_SZ],
    ) -> Result<u32, EmtrError> {
        self.check_request()?;
        if page > SIG_PAGE_MAX {
            return Err(EmtrError::InvalidArg);
        }
        let evt = self.sink();

        let mut inner = self.inner.lock().await;
        let sock = inner.sock(sock_num).ok_or(EmtrError::InvalidArg)?;
        let code = sock.info.cmd.sig_page_read;

        let mut rsp = SigPageRsp::new();
        let payload = sig_page_payload(page);
        let opt = CmdOptions::default();
        let len = inner.do_command(&evt, code, Some(&payload), Some(rsp.as_mut()), &opt).await?;
        if len != SigPageRsp::LEN || rsp.page() != page {
            return Err(EmtrError::BadFrame);
        }

        buf.copy_from_slice(rsp.data());
        Ok(rsp.timestamp())
    }

    /// Read the socket's calibration data into `buf` (128 bytes or more)
    pub async fn cal_data(&self, sock_num: u8, buf: &mut [u8]) -> Result<usize, EmtrError> {
        self.check_request()?;
        if buf.len() < CAL_DATA_SZ {
            return Err(EmtrError::InvalidArg);
        }
        let evt = self.sink();

        let mut inner = self.inner.lock().await;
        let sock = inner.sock(sock_num).ok_or(EmtrError::InvalidArg)?;
        let code = sock.info.cmd.cal_get;

        let opt = CmdOptions::default();
        inner.do_command(&evt, code, None, Some(buf), &opt).await
    }

    /// Commit the socket's calibration data to EMTR flash
    pub async fn save_cal_data(&self, sock_num: u8) -> Result<(), EmtrError> {
        self.check_request()?;
        let evt = self.sink();

        let mut inner = self.inner.lock().await;
        let sock = inner.sock(sock_num).ok_or(EmtrError::InvalidArg)?;
        let code = sock.info.cmd.cal_set;

        // The EMTR echoes the stored data; read it back and discard it
        let mut echo = [0u8; CAL_DATA_SZ];
        let opt = CmdOptions::default();
        inner.do_command(&evt, code, None, Some(&mut echo), &opt).await?;
        Ok(())
    }

    /// Program a firmware image into the EMTR
    ///
    /// The image is validated up front; nothing touches the wire on a
    /// [`BadCrc`](EmtrError::BadCrc). The poll loop is implicitly suspended
    /// for the duration because the driver lock is held. On success the
    /// EMTR is left running the new application and
    /// [`fw_version`](Self::fw_version) reflects it; on a failed transfer
    /// the previously-stored firmware keeps running.
    pub async fn update_firmware(&self, image: &[u8]) -> Result<(), EmtrError> {
        if !self.good.load(Ordering::Relaxed) {
            return Err(EmtrError::BadState);
        }
        let hdr = fw::check_image(image, &fw::FW_TYPE_EMTR)?;
        let evt = self.sink();

        let mut inner = self.inner.lock().await;
        inner.upgrade(&evt, image, &hdr).await
    }
}
