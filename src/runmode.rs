//! # Run-mode control and firmware upgrade
//!
//! The EMTR samples its serial RX line while coming out of reset: high
//! selects the application image, low parks it in the boot loader. Since
//! that line doubles as the host's UART TX, switching modes means briefly
//! stealing the TX pin from the UART, driving it to the mode level across a
//! reset pulse, and handing it back. The [`TxSelectPin`] trait is that
//! board-specific maneuver; the driver only dictates the sequencing.
//!
//! A firmware upgrade parks the EMTR in the boot loader, tells it to start
//! an XMODEM receive, streams header plus image data in 128-byte blocks,
//! and restarts the application.

use embassy_time::{with_timeout, Duration, Timer};
use embedded_hal::digital::OutputPin;
use embedded_io_async::{Read, ReadReady, Write};

use crate::cmd::cmd_device::StateRsp;
use crate::event::{Event, EventSink};
use crate::fw::FwHeader;
use crate::link::CmdOptions;
use crate::status::{RunMode, Version};
use crate::xmodem::XmodemSender;
use crate::{EmtrError, Inner, TxSelectPin};

/// Longest wait for the transmit buffer to drain before a mode switch
const TX_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Reset pulse width and settle time
const RESET_PULSE_MS: u64 = 10;

impl<U, R, S> Inner<U, R, S>
where
    U: Read + ReadReady + Write,
    R: OutputPin,
    S: TxSelectPin,
{
    /// Pulse the reset line with the mode-select level on the TX pin
    pub(crate) async fn reset_board(&mut self, mode: RunMode) -> Result<(), EmtrError> {
        let level = match mode {
            RunMode::Application => true,
            RunMode::BootLoader => false,
            RunMode::NotRunning => return Err(EmtrError::InvalidArg),
        };

        // Assert (low) the EMTR reset line
        self.reset_pin.set_low().map_err(|_| EmtrError::Pin)?;

        // Steal the TX pin from the UART and present the mode level
        self.tx_sel.drive(level).map_err(|_| EmtrError::Pin)?;
        Timer::after_millis(RESET_PULSE_MS).await;

        // Release the reset line with the level still applied
        self.reset_pin.set_high().map_err(|_| EmtrError::Pin)?;
        Timer::after_millis(RESET_PULSE_MS).await;

        // Hand the pin back to the UART
        self.tx_sel.release().map_err(|_| EmtrError::Pin)?;

        // Give the EMTR time to come up
        Timer::after_millis(u64::from(self.conf.reset_delay_ms)).await;
        Ok(())
    }

    /// Hard-reset the EMTR back into its current run mode
    pub(crate) async fn hard_reset(&mut self, evt: &EventSink<'_>) {
        self.device.reset_count += 1;
        let _ = self.reset_board(self.run_mode).await;
        evt.notify(Event::Reset);
    }

    /// Ask the EMTR which image is executing
    pub(crate) async fn run_mode_query(
        &mut self,
        evt: &EventSink<'_>,
    ) -> Result<(RunMode, Version), EmtrError> {
        let mut rsp = StateRsp::new();
        let opt = CmdOptions::default();
        let len = self
            .do_command(evt, self.conf.cmd.state_get, None, Some(rsp.as_mut()), &opt)
            .await?;
        if len != StateRsp::LEN {
            return Err(EmtrError::BadFrame);
        }

        let mode = match rsp.mode_char() {
            b'B' => RunMode::BootLoader,
            tag if tag == self.conf.app_tag => RunMode::Application,
            _tag => {
                #[cfg(feature = "defmt")]
                defmt::warn!("unrecognized EMTR mode tag {=u8:02x}", _tag);
                return Err(EmtrError::BadFrame);
            }
        };

        Ok((mode, rsp.version()))
    }

    /// Place the EMTR in the requested run mode and verify it got there
    ///
    /// Returns the firmware version of the image that is now executing.
    pub(crate) async fn run_mode_set(
        &mut self,
        evt: &EventSink<'_>,
        target: RunMode,
    ) -> Result<Version, EmtrError> {
        // Let in-flight transmit bytes drain before the pin is stolen
        let _ = with_timeout(TX_DRAIN_TIMEOUT, self.uart.flush()).await;

        self.reset_board(target).await?;
        self.flush_rx().await?;

        let (mode, version) = self.run_mode_query(evt).await?;
        self.run_mode = mode;
        self.poll_sample_ct = 0;

        if mode != target {
            #[cfg(feature = "defmt")]
            defmt::warn!("EMTR in {} after reset, expected {}", mode, target);
            return Err(EmtrError::BadState);
        }

        Ok(version)
    }

    /// Program a validated firmware image into the EMTR
    ///
    /// The caller has already checked the image (see
    /// [`fw::check_image`](crate::fw::check_image)); `hdr` is its decoded
    /// header. Holding the driver lock across this call is what keeps the
    /// poll loop quiet for the duration.
    pub(crate) async fn upgrade(
        &mut self,
        evt: &EventSink<'_>,
        image: &[u8],
        hdr: &FwHeader,
    ) -> Result<(), EmtrError> {
        #[cfg(feature = "defmt")]
        defmt::info!("EMTR firmware upgrade to {} starting", hdr.version);

        self.run_mode_set(evt, RunMode::BootLoader).await?;

        // Signal the boot loader to start the transfer
        let opt = CmdOptions::default();
        self.do_command(evt, self.conf.cmd.xmodem_start, None, None, &opt).await?;

        // The header is part of the payload: the boot loader checks it
        // again on its side before committing the image
        let result = self.send_image(&image[..hdr.file_size()]).await;

        #[cfg(feature = "defmt")]
        match &result {
            Ok(()) => defmt::info!("EMTR firmware transfer complete"),
            Err(e) => defmt::warn!("EMTR firmware transfer failed: {}", e),
        }

        // Restart the application whether or not the transfer worked;
        // a failed transfer leaves the previous image in place
        let version = self.run_mode_set(evt, RunMode::Application).await?;
        self.fw_version = version;
        result
    }

    async fn send_image(&mut self, file: &[u8]) -> Result<(), EmtrError> {
        let mut xm = XmodemSender::open(&mut self.uart).await?;
        match xm.write(file).await {
            Ok(()) => xm.close(false).await,
            Err(e) => {
                let _ = xm.close(true).await;
                Err(e)
            }
        }
    }
}
