//! # Command and response framing
//!
//! Every command sent to the EMTR is a fixed 8-byte frame:
//!
//! ```text
//! SOP(0x1B)  CMD  P0  P1  P2  P3  CKSUM  EOP(0x0A)
//! ```
//!
//! where `CKSUM = CMD ^ P0 ^ P1 ^ P2 ^ P3`. A command without parameters
//! carries a zero-filled payload.
//!
//! Responses are variable length:
//!
//! ```text
//! SOP(0x1B)  CMD  LEN  payload[LEN]  CKSUM  EOP(0x0A)
//! ```
//!
//! with `CKSUM = CMD ^ LEN ^ payload[0] ^ .. ^ payload[LEN-1]`. A command
//! that returns no data is acknowledged with the generic response
//! `CMD = 0xF0, LEN = 0`.

/// Start-of-packet marker
pub const SOP: u8 = 0x1B;

/// End-of-packet marker
pub const EOP: u8 = 0x0A;

/// CMD value of the generic acknowledge response
pub const GENERIC_ACK: u8 = 0xF0;

/// Size of an outbound command frame
pub const CMD_FRAME_SZ: usize = 8;

/// Size of the response header (SOP, CMD, LEN)
pub const RSP_HEAD_SZ: usize = 3;

/// Size of the response trailer (CKSUM, EOP)
pub const RSP_TAIL_SZ: usize = 2;

/// Build the 8-byte command frame for a command code and optional payload
pub fn command_frame(cmd: u8, payload: Option<&[u8; 4]>) -> [u8; CMD_FRAME_SZ] {
    let mut msg = [0u8; CMD_FRAME_SZ];
    msg[0] = SOP;
    msg[1] = cmd;
    if let Some(p) = payload {
        msg[2..6].copy_from_slice(p);
    }
    // Checksum covers CMD plus the 4 payload bytes
    msg[6] = msg[1..6].iter().fold(0, |ck, b| ck ^ b);
    msg[7] = EOP;
    msg
}

/// Compute the checksum of a response from its CMD, LEN, and payload bytes
pub fn response_cksum(cmd: u8, len: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(cmd ^ len, |ck, b| ck ^ b)
}

/// Response header: SOP, CMD, and payload length
#[derive(Clone, Copy, Default)]
pub struct RspHead(pub [u8; RSP_HEAD_SZ]);

impl RspHead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sop(&self) -> u8 {
        self.0[0]
    }

    pub fn cmd(&self) -> u8 {
        self.0[1]
    }

    pub fn len(&self) -> usize {
        self.0[2] as usize
    }
}

impl AsMut<[u8]> for RspHead {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}
