//! # XMODEM sender
//!
//! 128-byte-block XMODEM used to push firmware into the EMTR boot loader.
//! The receiver drives the start of the session: `'C'` selects CRC-16 mode,
//! NAK selects the original arithmetic checksum. Each block is
//! `SOH, n, !n, data[128], check`; the receiver answers ACK or NAK, and
//! either side can abort with CAN. The stream ends with two EOTs, the first
//! answered with NAK and the second with ACK.

use embassy_time::{with_timeout, Duration, Timer};
use embedded_io_async::{Read, Write};

use crate::EmtrError;

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const CRC_CHR: u8 = b'C';

/// Fill byte for a short final block
const PAD: u8 = 0x1A;

/// Block payload size
pub const BLOCK_SZ: usize = 128;

/// How long to wait for the receiver to start the session
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the reply to a block or EOT
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Send attempts per block before giving up
const BLOCK_RETRY: usize = 8;

/// Update a CRC-16/XMODEM accumulator with one byte (poly 0x1021)
pub fn crc16(crc: u16, data: u8) -> u16 {
    let mut crc = crc ^ (u16::from(data) << 8);
    for _ in 0..8 {
        if crc & 0x8000 != 0 {
            crc = (crc << 1) ^ 0x1021;
        } else {
            crc <<= 1;
        }
    }
    crc
}

/// XMODEM send session over a borrowed serial port
pub struct XmodemSender<'a, U> {
    uart: &'a mut U,
    crc_mode: bool,
    block_num: u8,
    block: [u8; BLOCK_SZ],
    fill: usize,
}

impl<'a, U> XmodemSender<'a, U>
where
    U: Read + Write,
{
    /// Wait for the receiver to announce itself and open the session
    pub async fn open(uart: &'a mut U) -> Result<XmodemSender<'a, U>, EmtrError> {
        let mut chr = [0u8; 1];
        let crc_mode = loop {
            let read = with_timeout(HANDSHAKE_TIMEOUT, uart.read(&mut chr))
                .await
                .map_err(|_| EmtrError::Timeout)?
                .map_err(|_| EmtrError::Io)?;
            if read == 0 {
                Timer::after_millis(10).await;
                continue;
            }
            match chr[0] {
                CRC_CHR => break true,
                NAK => break false,
                CAN => return Err(EmtrError::Link),
                _ => continue,
            }
        };

        #[cfg(feature = "defmt")]
        defmt::debug!("xmodem: receiver ready, crc={}", crc_mode);

        Ok(Self { uart, crc_mode, block_num: 1, block: [PAD; BLOCK_SZ], fill: 0 })
    }

    /// Queue data for transfer, sending every completed 128-byte block
    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), EmtrError> {
        while !data.is_empty() {
            let take = (BLOCK_SZ - self.fill).min(data.len());
            self.block[self.fill..self.fill + take].copy_from_slice(&data[..take]);
            self.fill += take;
            data = &data[take..];

            if self.fill == BLOCK_SZ {
                self.send_block().await?;
            }
        }
        Ok(())
    }

    /// Finish the session: flush the padded final block and send the
    /// double EOT, or abort the transfer with CAN
    pub async fn close(mut self, abort: bool) -> Result<(), EmtrError> {
        if abort {
            self.uart.write_all(&[CAN, CAN]).await.map_err(|_| EmtrError::Io)?;
            self.uart.flush().await.map_err(|_| EmtrError::Io)?;
            return Ok(());
        }

        if self.fill > 0 {
            self.block[self.fill..].fill(PAD);
            self.fill = BLOCK_SZ;
            self.send_block().await?;
        }

        // First EOT draws a NAK, the repeat is acknowledged
        for _ in 0..BLOCK_RETRY {
            self.uart.write_all(&[EOT]).await.map_err(|_| EmtrError::Io)?;
            self.uart.flush().await.map_err(|_| EmtrError::Io)?;
            match self.reply().await? {
                ACK => return Ok(()),
                NAK => continue,
                CAN => return Err(EmtrError::Link),
                _ => continue,
            }
        }
        Err(EmtrError::Link)
    }

    async fn send_block(&mut self) -> Result<(), EmtrError> {
        let head = [SOH, self.block_num, !self.block_num];

        let mut check = [0u8; 2];
        let check = if self.crc_mode {
            let crc = self.block.iter().fold(0u16, |crc, b| crc16(crc, *b));
            check.copy_from_slice(&crc.to_be_bytes());
            &check[..]
        } else {
            check[0] = self.block.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
            &check[..1]
        };

        for _ in 0..BLOCK_RETRY {
            self.uart.write_all(&head).await.map_err(|_| EmtrError::Io)?;
            self.uart.write_all(&self.block).await.map_err(|_| EmtrError::Io)?;
            self.uart.write_all(check).await.map_err(|_| EmtrError::Io)?;
            self.uart.flush().await.map_err(|_| EmtrError::Io)?;

            match self.reply().await? {
                ACK => {
                    self.block_num = self.block_num.wrapping_add(1);
                    self.fill = 0;
                    return Ok(());
                }
                CAN => return Err(EmtrError::Link),
                // NAK or noise: send the block again
                _ => continue,
            }
        }

        #[cfg(feature = "defmt")]
        defmt::warn!("xmodem: block {} exhausted retries", self.block_num);
        Err(EmtrError::Link)
    }

    async fn reply(&mut self) -> Result<u8, EmtrError> {
        let mut chr = [0u8; 1];
        loop {
            let read = with_timeout(REPLY_TIMEOUT, self.uart.read(&mut chr))
                .await
                .map_err(|_| EmtrError::Timeout)?
                .map_err(|_| EmtrError::Io)?;
            if read == 0 {
                Timer::after_millis(10).await;
                continue;
            }
            return Ok(chr[0]);
        }
    }
}
