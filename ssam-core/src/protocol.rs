//! SSAM serial hub wire protocol: frame headers and decoded records.

use serde::{Deserialize, Serialize};

/// Start-of-frame marker.
pub const SYN: [u8; 2] = [0xaa, 0x55];
/// Trailer of ACK/NAK frames (checksum of the empty payload).
pub const TERMINATOR: [u8; 2] = [0xff, 0xff];

/// Size of the frame control header.
pub const CTRL_LEN: usize = 4;
/// Size of the command header carried by data frames.
pub const CMD_LEN: usize = 8;
/// Size of a frame checksum.
pub const CRC_LEN: usize = 2;

/// Frame control type values.
pub mod frame_type {
    /// Unsequenced data frame.
    pub const DATA_NSQ: u8 = 0x00;
    /// Sequenced data frame; the receiver acknowledges it.
    pub const DATA_SEQ: u8 = 0x80;
    /// Acknowledgement.
    pub const ACK: u8 = 0x40;
    /// Negative acknowledgement.
    pub const NAK: u8 = 0x04;
}

/// Kind of a frame, derived from the control header type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Carries a command header and payload.
    Data,
    /// ACK/NAK: control header followed by the terminator only.
    Control,
}

impl FrameKind {
    pub fn from_type(ty: u8) -> Option<Self> {
        match ty {
            frame_type::DATA_NSQ | frame_type::DATA_SEQ => Some(FrameKind::Data),
            frame_type::ACK | frame_type::NAK => Some(FrameKind::Control),
            _ => None,
        }
    }
}

/// Frame control header. Follows the SYN marker, precedes a checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCtrl {
    #[serde(rename = "type")]
    pub ty: u8,
    /// Length of command header plus payload for data frames.
    pub len: u8,
    pub pad: u8,
    pub seq: u8,
}

impl FrameCtrl {
    pub fn from_bytes(b: [u8; CTRL_LEN]) -> Self {
        Self {
            ty: b[0],
            len: b[1],
            pad: b[2],
            seq: b[3],
        }
    }

    pub fn to_bytes(&self) -> [u8; CTRL_LEN] {
        [self.ty, self.len, self.pad, self.seq]
    }

    pub fn kind(&self) -> Option<FrameKind> {
        FrameKind::from_type(self.ty)
    }
}

/// Command header of a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCmd {
    #[serde(rename = "type")]
    pub ty: u8,
    /// Target category.
    pub tc: u8,
    pub outgoing: u8,
    pub incoming: u8,
    /// Instance id.
    pub iid: u8,
    pub rqid_lo: u8,
    pub rqid_hi: u8,
    /// Command id.
    pub cid: u8,
}

impl FrameCmd {
    pub fn from_bytes(b: [u8; CMD_LEN]) -> Self {
        Self {
            ty: b[0],
            tc: b[1],
            outgoing: b[2],
            incoming: b[3],
            iid: b[4],
            rqid_lo: b[5],
            rqid_hi: b[6],
            cid: b[7],
        }
    }

    pub fn to_bytes(&self) -> [u8; CMD_LEN] {
        [
            self.ty,
            self.tc,
            self.outgoing,
            self.incoming,
            self.iid,
            self.rqid_lo,
            self.rqid_hi,
            self.cid,
        ]
    }

    /// Request id composed from its two halves.
    pub fn rqid(&self) -> u16 {
        u16::from_le_bytes([self.rqid_lo, self.rqid_hi])
    }
}

/// One decoded frame, in stream order.
///
/// Serializes as `{ctrl, cmd, payload}` or `{ctrl}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    Data {
        ctrl: FrameCtrl,
        cmd: FrameCmd,
        payload: Vec<u8>,
    },
    Control {
        ctrl: FrameCtrl,
    },
}

impl Record {
    pub fn ctrl(&self) -> &FrameCtrl {
        match self {
            Record::Data { ctrl, .. } | Record::Control { ctrl } => ctrl,
        }
    }

    pub fn cmd(&self) -> Option<&FrameCmd> {
        match self {
            Record::Data { cmd, .. } => Some(cmd),
            Record::Control { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Record::Data { payload, .. } => Some(payload),
            Record::Control { .. } => None,
        }
    }
}
