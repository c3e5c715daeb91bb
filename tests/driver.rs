//! End-to-end driver tests over a scripted in-memory serial port.
//!
//! The mock wire watches for complete 8-byte command frames and answers
//! them from per-command response scripts, the same way the EMTR would.
//! Responses are injected only after the command is written, which keeps
//! them safe from the RX flushes the driver performs around resets.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use embassy_futures::block_on;
use embassy_futures::join::join;
use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Timer};

use emtr::{
    CmdOptions, Config, DevCmdCodes, Emtr, EmtrError, Event, RunMode, SockCmdCodes, SockInfo,
    TxSelectPin, Version,
};

const CMD_STATE: u8 = 0x01;
const CMD_STATUS: u8 = 0x02;
const CMD_KWH: u8 = 0x0A;
const CMD_INSTANT: u8 = 0x0B;
const CMD_SOCK1_ON: u8 = 0x04;
const CMD_SOCK1_OFF: u8 = 0x05;
const CMD_SOCK2_ON: u8 = 0x06;
const CMD_SOCK2_OFF: u8 = 0x07;
const CMD_SOCK1_SIG_TS: u8 = 0x20;

const APP_TAG: u8 = b'E';

static SOCKETS: [SockInfo; 2] = [
    SockInfo {
        sock_num: 1,
        cmd: SockCmdCodes {
            turn_on: CMD_SOCK1_ON,
            turn_off: CMD_SOCK1_OFF,
            sig_ts_read: CMD_SOCK1_SIG_TS,
            sig_page_read: 0x21,
            cal_get: 0x22,
            cal_set: 0x23,
        },
    },
    SockInfo {
        sock_num: 2,
        cmd: SockCmdCodes {
            turn_on: CMD_SOCK2_ON,
            turn_off: CMD_SOCK2_OFF,
            sig_ts_read: 0x24,
            sig_page_read: 0x25,
            cal_get: 0x26,
            cal_set: 0x27,
        },
    },
];

fn config() -> Config {
    Config::new(
        APP_TAG,
        DevCmdCodes {
            state_get: CMD_STATE,
            status_get: CMD_STATUS,
            kwh_get: CMD_KWH,
            instant_get: CMD_INSTANT,
            xmodem_start: 0x30,
        },
        &SOCKETS,
    )
    .with_acc_chan(1)
}

#[derive(Default)]
struct WireState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    frames: Vec<[u8; 8]>,
    partial: Vec<u8>,
    scripts: HashMap<u8, VecDeque<Vec<u8>>>,
    defaults: HashMap<u8, Vec<u8>>,
    tx_levels: Vec<bool>,
    resets: usize,
}

#[derive(Clone, Default)]
struct Wire(Arc<Mutex<WireState>>);

impl Wire {
    /// Queue one response for the next occurrence of `cmd`
    fn push_rsp(&self, cmd: u8, bytes: Vec<u8>) {
        self.0.lock().unwrap().scripts.entry(cmd).or_default().push_back(bytes);
    }

    /// Answer every occurrence of `cmd` with `bytes` once the script for
    /// it runs dry
    fn set_default(&self, cmd: u8, bytes: Vec<u8>) {
        self.0.lock().unwrap().defaults.insert(cmd, bytes);
    }

    /// Preload raw bytes into the receive direction
    fn preload(&self, bytes: &[u8]) {
        self.0.lock().unwrap().rx.extend(bytes.iter().copied());
    }

    fn frames(&self) -> Vec<[u8; 8]> {
        self.0.lock().unwrap().frames.clone()
    }

    fn tx(&self) -> Vec<u8> {
        self.0.lock().unwrap().tx.clone()
    }

    fn tx_levels(&self) -> Vec<bool> {
        self.0.lock().unwrap().tx_levels.clone()
    }

    /// Number of reset-line assertions observed
    fn resets(&self) -> usize {
        self.0.lock().unwrap().resets
    }
}

impl WireState {
    fn feed(&mut self, byte: u8) {
        // Resynchronize on SOP; non-frame traffic (XMODEM) is ignored
        if self.partial.is_empty() && byte != 0x1B {
            return;
        }
        self.partial.push(byte);
        if self.partial.len() < 8 {
            return;
        }

        let frame: [u8; 8] = self.partial[..8].try_into().unwrap();
        self.partial.clear();
        self.frames.push(frame);

        let cmd = frame[1];
        let rsp = match self.scripts.get_mut(&cmd).and_then(|q| q.pop_front()) {
            Some(rsp) => Some(rsp),
            None => self.defaults.get(&cmd).cloned(),
        };
        if let Some(rsp) = rsp {
            self.rx.extend(rsp.iter().copied());
        }
    }
}

struct MockUart(Wire);

impl embedded_io_async::ErrorType for MockUart {
    type Error = Infallible;
}

impl embedded_io_async::Read for MockUart {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut st = self.0 .0.lock().unwrap();
        let n = st.rx.len().min(buf.len());
        for slot in buf[..n].iter_mut() {
            *slot = st.rx.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl embedded_io_async::ReadReady for MockUart {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.0 .0.lock().unwrap().rx.is_empty())
    }
}

impl embedded_io_async::Write for MockUart {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut st = self.0 .0.lock().unwrap();
        st.tx.extend_from_slice(buf);
        for &b in buf {
            st.feed(b);
        }
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct MockResetPin(Wire);

impl embedded_hal::digital::ErrorType for MockResetPin {
    type Error = Infallible;
}

impl embedded_hal::digital::OutputPin for MockResetPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0 .0.lock().unwrap().resets += 1;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct MockTxSel(Wire);

impl TxSelectPin for MockTxSel {
    type Error = Infallible;

    fn drive(&mut self, level: bool) -> Result<(), Self::Error> {
        self.0 .0.lock().unwrap().tx_levels.push(level);
        Ok(())
    }

    fn release(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

type TestDriver = Emtr<MockUart, MockResetPin, MockTxSel>;

fn setup() -> (Wire, TestDriver) {
    let wire = Wire::default();
    let driver = Emtr::new(
        MockUart(wire.clone()),
        MockResetPin(wire.clone()),
        MockTxSel(wire.clone()),
        config(),
    );
    (wire, driver)
}

/// Build a response frame with a valid checksum
fn rsp(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x1B, cmd, payload.len() as u8];
    out.extend_from_slice(payload);
    let ck = payload.iter().fold(cmd ^ payload.len() as u8, |a, b| a ^ b);
    out.push(ck);
    out.push(0x0A);
    out
}

fn ack() -> Vec<u8> {
    rsp(0xF0, &[])
}

fn state_rsp(tag: u8, major: u8, minor: u8, patch: u8) -> Vec<u8> {
    rsp(CMD_STATE, &[tag, major, minor, patch])
}

/// Status report for two sockets: flag bytes in wire order (socket 2 first)
fn status_rsp(sock2_flags: u8, sock1_flags: u8, temp: u16, uptime: u32) -> Vec<u8> {
    let mut payload = vec![sock2_flags, sock1_flags];
    payload.extend_from_slice(&temp.to_be_bytes());
    payload.extend_from_slice(&uptime.to_be_bytes());
    rsp(CMD_STATUS, &payload)
}

/// Script the boot-loader and application probes done by init()
fn script_init(wire: &Wire) {
    wire.push_rsp(CMD_STATE, state_rsp(b'B', 1, 2, 3));
    wire.push_rsp(CMD_STATE, state_rsp(APP_TAG, 3, 0, 1));
}

#[test]
fn init_probes_boot_loader_then_application() {
    block_on(async {
        let (wire, driver) = setup();
        script_init(&wire);

        driver.init().await.unwrap();

        assert_eq!(driver.bl_version().await, Version::new(1, 2, 3));
        assert_eq!(driver.fw_version().await, Version::new(3, 0, 1));
        assert_eq!(driver.run_mode().await, RunMode::Application);

        // Reset was pulsed with the boot-loader level first, then the
        // application level
        assert_eq!(wire.tx_levels(), vec![false, true]);

        // The first successful exchange brings communication up
        assert_eq!(driver.try_next_event(), Some(Event::CommUp));
        assert_eq!(driver.try_next_event(), None);

        assert!(driver.device_status().await.is_err());
        driver.start().unwrap();
        assert!(driver.device_status().await.unwrap().comm_up);
    });
}

#[test]
fn init_fails_without_boot_loader_mode() {
    block_on(async {
        let (wire, driver) = setup();
        // Boot-loader probe answers with the application tag
        wire.push_rsp(CMD_STATE, state_rsp(APP_TAG, 3, 0, 1));
        wire.set_default(CMD_STATE, state_rsp(APP_TAG, 3, 0, 1));

        assert_eq!(driver.init().await, Err(EmtrError::BadState));
        assert!(driver.start().is_err());
    });
}

#[test]
fn command_frames_on_the_wire() {
    block_on(async {
        let (wire, driver) = setup();
        script_init(&wire);
        driver.init().await.unwrap();
        driver.start().unwrap();

        wire.push_rsp(0x03, rsp(0x03, &[0xAA, 0x55]));

        let mut buf = [0u8; 8];
        let opt = CmdOptions::default();
        let len = driver.command(0x03, None, Some(&mut buf), &opt).await.unwrap();

        assert_eq!(len, 2);
        assert_eq!(&buf[..2], &[0xAA, 0x55]);
        // The frame for cmd 0x03 with no payload
        let frames = wire.frames();
        assert_eq!(
            frames.last().unwrap(),
            &[0x1B, 0x03, 0x00, 0x00, 0x00, 0x00, 0x03, 0x0A]
        );
    });
}

#[test]
fn command_retries_after_bad_checksum() {
    block_on(async {
        let (wire, driver) = setup();
        script_init(&wire);
        driver.init().await.unwrap();
        driver.start().unwrap();

        let mut broken = rsp(0x03, &[0x11]);
        let ck_at = broken.len() - 2;
        broken[ck_at] ^= 0xFF;
        wire.push_rsp(0x03, broken);
        wire.push_rsp(0x03, rsp(0x03, &[0x11]));

        let mut buf = [0u8; 4];
        let opt = CmdOptions::default();
        let len = driver.command(0x03, None, Some(&mut buf), &opt).await.unwrap();

        assert_eq!(len, 1);
        assert_eq!(buf[0], 0x11);
        // The same frame went out twice
        let sent = wire.frames().iter().filter(|f| f[1] == 0x03).count();
        assert_eq!(sent, 2);
    });
}

#[test]
fn link_loss_and_recovery() {
    block_on(async {
        let (wire, driver) = setup();
        script_init(&wire);
        driver.init().await.unwrap();
        driver.start().unwrap();
        assert_eq!(driver.try_next_event(), Some(Event::CommUp));

        // No responder for 0x40: every attempt times out
        let opt = CmdOptions { timeout: Duration::from_millis(20), no_resp: false };
        let err = driver.command(0x40, None, None, &opt).await.unwrap_err();
        assert_eq!(err, EmtrError::Link);

        let status = driver.device_status().await.unwrap();
        assert!(!status.comm_up);
        // The final attempt hard-reset the EMTR
        assert_eq!(status.reset_count, 1);
        // Two resets from init, one from the retry ladder
        assert_eq!(wire.resets(), 3);
        assert_eq!(driver.try_next_event(), Some(Event::Reset));
        assert_eq!(driver.try_next_event(), Some(Event::CommDown));
        assert_eq!(driver.try_next_event(), None);

        // A working command brings the link back, once
        wire.push_rsp(0x40, ack());
        driver.command(0x40, None, None, &opt).await.unwrap();
        assert!(driver.device_status().await.unwrap().comm_up);
        assert_eq!(driver.try_next_event(), Some(Event::CommUp));
        assert_eq!(driver.try_next_event(), None);
    });
}

#[test]
fn set_relay_sends_socket_codes() {
    block_on(async {
        let (wire, driver) = setup();
        script_init(&wire);
        driver.init().await.unwrap();
        driver.start().unwrap();

        wire.push_rsp(CMD_SOCK1_ON, ack());
        wire.push_rsp(CMD_SOCK1_ON, ack());
        wire.push_rsp(CMD_SOCK2_OFF, ack());

        driver.set_relay(1, true).await.unwrap();
        // Idempotent from the caller's perspective; the EMTR sees it again
        driver.set_relay(1, true).await.unwrap();
        driver.set_relay(2, false).await.unwrap();
        assert_eq!(driver.set_relay(9, true).await, Err(EmtrError::InvalidArg));

        let cmds: Vec<u8> = wire.frames().iter().map(|f| f[1]).collect();
        assert_eq!(cmds.iter().filter(|c| **c == CMD_SOCK1_ON).count(), 2);
        assert_eq!(cmds.iter().filter(|c| **c == CMD_SOCK2_OFF).count(), 1);
    });
}

#[test]
fn signature_timestamp_round_trip() {
    block_on(async {
        let (wire, driver) = setup();
        script_init(&wire);
        driver.init().await.unwrap();
        driver.start().unwrap();

        wire.push_rsp(CMD_SOCK1_SIG_TS, rsp(CMD_SOCK1_SIG_TS, &[0x00, 0x01, 0x00, 0x00, 0x07]));

        let (ts, reason) = driver.read_signature_timestamp(1).await.unwrap();
        assert_eq!(ts, 0x0001_0000);
        assert_eq!(reason, 7);
    });
}

#[test]
fn poll_loop_debounces_and_reads_energy() {
    block_on(async {
        let (wire, driver) = setup();
        script_init(&wire);

        // Everything idle at first
        wire.set_default(CMD_STATUS, status_rsp(0x00, 0x00, 25, 1000));
        // Watt-hours: socket 2 first on the wire
        wire.set_default(CMD_KWH, rsp(CMD_KWH, &[0, 0, 0x20, 0x00, 0, 0, 0x10, 0x00]));
        // Instant energy, socket 2 first on the wire
        wire.set_default(
            CMD_INSTANT,
            rsp(
                CMD_INSTANT,
                &[
                    0x04, 0x5A, 0x00, 0x0F, 0x00, 0x32, 0x00, 0x63, // socket 2
                    0x04, 0x5A, 0x00, 0x1E, 0x00, 0x64, 0x00, 0x5A, // socket 1
                ],
            ),
        );

        driver.init().await.unwrap();
        driver.start().unwrap();
        while driver.try_next_event().is_some() {}

        let control = async {
            // Let a couple of ticks seed the trackers
            Timer::after_millis(250).await;
            assert!(!driver.sock_status(1).await.unwrap().relay_active);
            assert_eq!(driver.device_status().await.unwrap().temperature, 25);
            assert_eq!(driver.device_status().await.unwrap().uptime, 1000);

            // Socket 1 relay turns on (second byte on the wire)
            wire.set_default(CMD_STATUS, status_rsp(0x00, 0x04, 25, 1000));

            // One tick moves the change to pending, the next promotes it
            Timer::after_millis(350).await;
            let s1 = driver.sock_status(1).await.unwrap();
            assert!(s1.relay_active);
            assert!(!driver.sock_status(2).await.unwrap().relay_active);

            // Cross the tenth tick so energy is read
            Timer::after_millis(800).await;
            let s1 = driver.sock_status(1).await.unwrap();
            let s2 = driver.sock_status(2).await.unwrap();
            // Wire order is reversed: socket 1 is the second record
            assert_eq!(s1.inst_energy.d_volts, 1114);
            assert_eq!(s1.inst_energy.m_amps, 30);
            assert_eq!(s1.inst_energy.d_watts, 100);
            assert_eq!(s2.inst_energy.m_amps, 15);
            assert_eq!(s2.inst_energy.d_watts, 50);
            // No active load: power factor reads 100 regardless of the wire
            assert_eq!(s1.inst_energy.p_factor, 100);
            assert_eq!(s2.inst_energy.p_factor, 100);
            assert_eq!(s1.d_watt_hours, 0x1000);
            assert_eq!(s2.d_watt_hours, 0x2000);

            driver.stop().await.unwrap();
        };

        join(driver.run(), control).await;

        // Exactly one relay event surfaced, for socket 1
        let mut relay_events = vec![];
        while let Some(event) = driver.try_next_event() {
            if let Event::RelayState { sock_num, active } = event {
                relay_events.push((sock_num, active));
            }
        }
        assert_eq!(relay_events, vec![(1, true)]);
    });
}

#[test]
fn pause_keeps_status_but_skips_energy() {
    block_on(async {
        let (wire, driver) = setup();
        script_init(&wire);
        wire.set_default(CMD_STATUS, status_rsp(0x00, 0x00, 30, 500));

        driver.init().await.unwrap();
        driver.start().unwrap();

        let control = async {
            driver.pause().await;
            // Well past the tenth tick
            Timer::after_millis(1300).await;
            // Status stayed fresh while paused
            assert_eq!(driver.device_status().await.unwrap().temperature, 30);
            driver.stop().await.unwrap();
        };

        join(driver.run(), control).await;

        // No energy commands went out
        let frames = wire.frames();
        assert!(frames.iter().all(|f| f[1] != CMD_KWH && f[1] != CMD_INSTANT));
        assert!(frames.iter().any(|f| f[1] == CMD_STATUS));
    });
}

#[test]
fn xmodem_sender_block_structure() {
    block_on(async {
        let wire = Wire::default();
        let mut uart = MockUart(wire.clone());
        // Receiver asks for CRC mode, ACKs both blocks, NAKs the first EOT
        wire.preload(&[b'C', 0x06, 0x06, 0x15, 0x06]);

        let data: Vec<u8> = (0..150u8).collect();
        let mut xm = emtr::xmodem::XmodemSender::open(&mut uart).await.unwrap();
        xm.write(&data).await.unwrap();
        xm.close(false).await.unwrap();

        let tx = wire.tx();
        assert_eq!(tx.len(), 268);
        // Block 1: SOH, number, complement, 128 data bytes, CRC-16
        assert_eq!(&tx[..3], &[0x01, 0x01, 0xFE]);
        assert_eq!(&tx[3..131], &data[..128]);
        let crc = data[..128].iter().fold(0u16, |c, b| emtr::xmodem::crc16(c, *b));
        assert_eq!(&tx[131..133], &crc.to_be_bytes());
        // Block 2: the 22-byte remainder padded out with 0x1A
        assert_eq!(&tx[133..136], &[0x01, 0x02, 0xFD]);
        assert_eq!(&tx[136..158], &data[128..150]);
        assert!(tx[158..264].iter().all(|b| *b == 0x1A));
        // End of stream: EOT answered NAK, repeated EOT answered ACK
        assert_eq!(&tx[266..], &[0x04, 0x04]);
    });
}

#[test]
fn run_loop_survives_select_race() {
    // stop() must end the loop even when sent right after a tick fires
    block_on(async {
        let (wire, driver) = setup();
        script_init(&wire);
        wire.set_default(CMD_STATUS, status_rsp(0, 0, 20, 1));
        driver.init().await.unwrap();
        driver.start().unwrap();

        let control = async {
            Timer::after_millis(105).await;
            driver.stop().await.unwrap();
        };
        match select(driver.run(), control).await {
            Either::First(()) | Either::Second(()) => {}
        }
        assert!(!driver.is_running());
    });
}
