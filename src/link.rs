//! # Serial link and command engine
//!
//! One command transaction is: build the 8-byte frame, write it, read back
//! and validate the response. A transaction gets three attempts; from the
//! second attempt on the RX buffer is flushed after a 100 ms pause, and the
//! final attempt is preceded by a hard reset of the EMTR into its current
//! run mode. Exhausting the attempts marks communication down and returns
//! [`EmtrError::Link`]; the next successful transaction marks it up again.
//! Both edges surface as one-shot [`Event`](crate::Event)s.

use embassy_time::{with_deadline, Duration, Instant, Timer};
use embedded_io_async::{Read, ReadReady, Write};

use crate::event::{Event, EventSink};
use crate::frame;
use crate::{EmtrError, Inner, TxSelectPin};
use embedded_hal::digital::OutputPin;

/// Attempts per command before declaring the link down
const CMD_ATTEMPTS: u32 = 3;

/// Pause before a retry attempt
const RETRY_DELAY_MS: u64 = 100;

/// Delay inserted before the command following a relay transition, while
/// the EMTR samples the power characteristics of the attached device
const HOLDOFF_DELAY_MS: u64 = 150;

/// Per-command options for [`Emtr::command`](crate::Emtr::command)
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CmdOptions {
    /// Deadline for reading the complete response
    pub timeout: Duration,
    /// Fire and forget: do not read a response
    pub no_resp: bool,
}

impl Default for CmdOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(5000), no_resp: false }
    }
}

impl<U, R, S> Inner<U, R, S>
where
    U: Read + ReadReady + Write,
    R: OutputPin,
    S: TxSelectPin,
{
    /// Read exactly `buf.len()` bytes, or fail when the deadline passes
    pub(crate) async fn read_exact(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<(), EmtrError> {
        let mut at = 0;
        while at < buf.len() {
            if Instant::now() >= deadline {
                return Err(EmtrError::Timeout);
            }
            match with_deadline(deadline, self.uart.read(&mut buf[at..])).await {
                Err(_) => return Err(EmtrError::Timeout),
                Ok(Err(_)) => return Err(EmtrError::Io),
                Ok(Ok(0)) => Timer::after_millis(10).await,
                Ok(Ok(n)) => at += n,
            }
        }
        Ok(())
    }

    /// Drain whatever is sitting in the receive buffer
    pub(crate) async fn flush_rx(&mut self) -> Result<(), EmtrError> {
        let mut scratch = [0u8; 16];
        while self.uart.read_ready().map_err(|_| EmtrError::Io)? {
            if self.uart.read(&mut scratch).await.map_err(|_| EmtrError::Io)? == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Read and discard the rest of a response that cannot be used
    async fn flush_msg(&mut self, mut remain: usize, deadline: Instant) {
        let mut raw = [0u8; 16];
        while remain > 0 {
            let take = remain.min(raw.len());
            if self.read_exact(&mut raw[..take], deadline).await.is_err() {
                return;
            }
            remain -= take;
        }
    }

    /// Frame and write one command
    async fn send_command(&mut self, cmd: u8, payload: Option<&[u8; 4]>) -> Result<(), EmtrError> {
        // Must hold off commands when a socket has been switched on or off
        // because the EMTR samples the power characteristics when it
        // transitions
        if self.hold_off_command {
            self.hold_off_command = false;
            Timer::after_millis(HOLDOFF_DELAY_MS).await;
        }

        let msg = frame::command_frame(cmd, payload);
        self.uart.write_all(&msg).await.map_err(|_| EmtrError::Io)?;
        self.uart.flush().await.map_err(|_| EmtrError::Io)
    }

    /// Read and validate one response
    ///
    /// With a return buffer the response CMD must echo the request; without
    /// one only the generic acknowledge is accepted. Returns the payload
    /// length.
    async fn read_response(
        &mut self,
        cmd: u8,
        ret: Option<&mut [u8]>,
        opt: &CmdOptions,
    ) -> Result<usize, EmtrError> {
        let deadline = Instant::now() + opt.timeout;

        let mut head = frame::RspHead::new();
        self.read_exact(head.as_mut(), deadline).await?;

        if head.sop() != frame::SOP {
            #[cfg(feature = "defmt")]
            defmt::warn!("expected SOP, got {=u8:02x}", head.sop());
            return Err(EmtrError::BadFrame);
        }

        let len = head.len();
        let (expect_cmd, capacity) = match &ret {
            Some(buf) => (cmd, buf.len()),
            None => (frame::GENERIC_ACK, 0),
        };

        if head.cmd() != expect_cmd || len > capacity {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "bad response: cmd {=u8:02x} len {=usize} (expected {=u8:02x})",
                head.cmd(),
                len,
                expect_cmd
            );
            // Drain the payload and trailer so the next command starts clean
            self.flush_msg(len + frame::RSP_TAIL_SZ, deadline).await;
            return Err(EmtrError::BadFrame);
        }

        let mut cksum = head.cmd() ^ (len as u8);
        if len > 0 {
            // Capacity was checked above, ret must be present here
            let buf = ret.map(|b| &mut b[..len]).unwrap_or(&mut []);
            self.read_exact(buf, deadline).await?;
            cksum = buf.iter().fold(cksum, |ck, b| ck ^ b);
        }

        let mut tail = [0u8; frame::RSP_TAIL_SZ];
        self.read_exact(&mut tail, deadline).await?;

        if tail[0] != cksum {
            #[cfg(feature = "defmt")]
            defmt::warn!("checksum failed: expected {=u8:02x}, got {=u8:02x}", cksum, tail[0]);
            return Err(EmtrError::BadFrame);
        }

        Ok(len)
    }

    /// Execute one command transaction with retries
    ///
    /// Returns the number of payload bytes copied into `ret`.
    pub(crate) async fn do_command(
        &mut self,
        evt: &EventSink<'_>,
        cmd: u8,
        payload: Option<&[u8; 4]>,
        mut ret: Option<&mut [u8]>,
        opt: &CmdOptions,
    ) -> Result<usize, EmtrError> {
        if cmd == 0 {
            // Command not supported by this EMTR firmware family
            return Err(EmtrError::InvalidArg);
        }

        for attempt in 0..CMD_ATTEMPTS {
            if attempt > 0 {
                #[cfg(feature = "defmt")]
                defmt::debug!("command {=u8:02x}: retry #{=u32}", cmd, attempt);

                if attempt == CMD_ATTEMPTS - 1 {
                    // Last try, reset the EMTR first
                    self.hard_reset(evt).await;
                }

                Timer::after_millis(RETRY_DELAY_MS).await;
                let _ = self.flush_rx().await;
            }

            if self.send_command(cmd, payload).await.is_err() {
                continue;
            }

            let len = if opt.no_resp {
                0
            } else {
                match self.read_response(cmd, ret.as_deref_mut(), opt).await {
                    Ok(len) => len,
                    Err(_) => continue,
                }
            };

            // A validated response is proof of life; a fire-and-forget
            // send is not
            if !opt.no_resp && !self.device.comm_up {
                self.device.comm_up = true;
                evt.notify(Event::CommUp);
            }

            return Ok(len);
        }

        #[cfg(feature = "defmt")]
        defmt::warn!("command {=u8:02x}: exhausted retries", cmd);

        if self.device.comm_up {
            self.device.comm_up = false;
            evt.notify(Event::CommDown);
        }

        Err(EmtrError::Link)
    }
}
