// Per-socket commands API

/// Highest power-signature page number
pub const SIG_PAGE_MAX: u8 = 47;

/// Size of one power-signature page
pub const SIG_PAGE_SZ: usize = 128;

/// Parameter bytes selecting one page of the power signature
pub fn sig_page_payload(page: u8) -> [u8; 4] {
    [page, 0, 0, 0]
}

// Response structs

/// Response for the ReadSignatureTimestamp command
///
/// Bytes 0-3 hold the capture time, byte 4 the capture reason.
#[derive(Default)]
pub struct SigTsRsp([u8; 5]);

impl SigTsRsp {
    pub const LEN: usize = 5;

    /// Create a new response buffer
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn reason(&self) -> u8 {
        self.0[4]
    }
}

impl AsMut<[u8]> for SigTsRsp {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Response for the ReadSignaturePage command
///
/// Bytes 0-3 hold the capture time, byte 4 echoes the requested page
/// number, bytes 5.. hold one page of signature data.
pub struct SigPageRsp([u8; SIG_PAGE_RSP_SZ]);

const SIG_PAGE_RSP_SZ: usize = 5 + SIG_PAGE_SZ;

impl SigPageRsp {
    pub const LEN: usize = SIG_PAGE_RSP_SZ;

    /// Create a new response buffer
    pub fn new() -> Self {
        Self([0; SIG_PAGE_RSP_SZ])
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Page number echoed by the EMTR
    pub fn page(&self) -> u8 {
        self.0[4]
    }

    pub fn data(&self) -> &[u8; SIG_PAGE_SZ] {
        self.0[5..].try_into().unwrap_or(&[0; SIG_PAGE_SZ])
    }
}

impl AsMut<[u8]> for SigPageRsp {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}
