//! Named requests: static command tables and small request builders.

use crate::transaction::{Request, RequestFlags};
use crate::transfer::{Chunk, ChunkError, ChunkSource};

/// Immutable request template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub target_category: u8,
    pub target_id: u8,
    pub command_id: u8,
    pub instance_id: u8,
    pub flags: RequestFlags,
}

impl Command {
    pub const fn new(tc: u8, tid: u8, cid: u8, iid: u8, flags: RequestFlags) -> Self {
        Self {
            target_category: tc,
            target_id: tid,
            command_id: cid,
            instance_id: iid,
            flags,
        }
    }

    pub fn request(&self) -> Request {
        Request::new(
            self.target_category,
            self.target_id,
            self.command_id,
            self.instance_id,
        )
        .with_flags(self.flags)
    }
}

/// Look up a command by name in a table.
pub fn lookup<'t>(table: &'t [(&'static str, Command)], name: &str) -> Option<&'t Command> {
    table.iter().find(|(n, _)| *n == name).map(|(_, c)| c)
}

/// Names of a table, in table order.
pub fn names<'t>(table: &'t [(&'static str, Command)]) -> impl Iterator<Item = &'static str> + 't {
    table.iter().map(|(n, _)| *n)
}

const NONE: RequestFlags = RequestFlags::NONE;
const RSP: RequestFlags = RequestFlags::HAS_RESPONSE;

/// Detachment system (clipboard latch) commands.
pub const DTX_COMMANDS: &[(&str, Command)] = &[
    ("lock", Command::new(0x11, 0x01, 0x06, 0x00, NONE)),
    ("unlock", Command::new(0x11, 0x01, 0x07, 0x00, NONE)),
    ("request", Command::new(0x11, 0x01, 0x08, 0x00, NONE)),
    ("confirm", Command::new(0x11, 0x01, 0x09, 0x00, NONE)),
    ("heartbeat", Command::new(0x11, 0x01, 0x0a, 0x00, NONE)),
    ("cancel", Command::new(0x11, 0x01, 0x0b, 0x00, NONE)),
    ("get-state", Command::new(0x11, 0x01, 0x0c, 0x00, RSP)),
    ("get-opmode", Command::new(0x11, 0x01, 0x0d, 0x00, RSP)),
    ("get-status", Command::new(0x11, 0x01, 0x11, 0x00, RSP)),
];

/// Event (un)registration through the SAM, KIP and REG subsystems.
pub const EVENT_COMMANDS: &[(&str, Command)] = &[
    ("sam-enable", Command::new(0x01, 0x01, 0x0b, 0x00, RSP)),
    ("sam-disable", Command::new(0x01, 0x01, 0x0c, 0x00, RSP)),
    ("kip-enable", Command::new(0x0e, 0x02, 0x27, 0x00, RSP)),
    ("kip-disable", Command::new(0x0e, 0x02, 0x28, 0x00, RSP)),
    ("reg-enable", Command::new(0x21, 0x02, 0x01, 0x00, RSP)),
    ("reg-disable", Command::new(0x21, 0x02, 0x02, 0x00, RSP)),
];

/// Response size of event registration commands.
pub const EVENT_RESPONSE_CAPACITY: usize = 8;

/// Event source to (un)register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSpec {
    pub target_category: u8,
    /// Events are sent sequenced.
    pub sequenced: u8,
    pub instance_id: u8,
}

impl EventSpec {
    /// Request id the controller uses for this category's events.
    pub fn rqid(&self) -> u16 {
        u16::from(self.target_category)
    }

    pub fn payload(&self) -> [u8; 5] {
        let [lo, hi] = self.rqid().to_le_bytes();
        [self.target_category, self.sequenced, lo, hi, self.instance_id]
    }
}

/// Build an event registration request from `EVENT_COMMANDS`.
pub fn event_request(name: &str, event: &EventSpec) -> Option<Request> {
    let cmd = lookup(EVENT_COMMANDS, name)?;
    Some(
        cmd.request()
            .with_payload(event.payload())
            .with_response_capacity(EVENT_RESPONSE_CAPACITY),
    )
}

/// Keyboard on the legacy HID interface (target category 0x08).
pub mod legacy_keyboard {
    use super::*;

    const TC: u8 = 0x08;
    const TID: u8 = 0x02;

    /// Descriptor entry: 0 HID descriptor, 1 report descriptor, 2 device attributes.
    pub fn get_descriptor(entry: u8) -> Request {
        Request::new(TC, TID, 0x00, 0x00)
            .with_flags(RequestFlags::HAS_RESPONSE)
            .with_payload(vec![entry])
    }

    pub fn get_feature_report(num: u8) -> Request {
        Request::new(TC, TID, 0x0b, 0x00)
            .with_flags(RequestFlags::HAS_RESPONSE)
            .with_payload(vec![num])
    }

    pub fn set_capslock_led(on: bool) -> Request {
        Request::new(TC, TID, 0x01, 0x00).with_payload(vec![u8::from(on)])
    }
}

/// HID descriptor slice sub-header (`<BIIB`, 10 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidSlice {
    pub entry: u8,
    pub offset: u32,
    pub length: u32,
    pub end: bool,
}

impl HidSlice {
    pub const LEN: usize = 10;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0] = self.entry;
        b[1..5].copy_from_slice(&self.offset.to_le_bytes());
        b[5..9].copy_from_slice(&self.length.to_le_bytes());
        b[9] = u8::from(self.end);
        b
    }

    pub fn parse(b: &[u8]) -> Result<(Self, &[u8]), ChunkError> {
        if b.len() < Self::LEN {
            return Err(ChunkError::Short {
                len: b.len(),
                needed: Self::LEN,
            });
        }
        let slice = Self {
            entry: b[0],
            offset: u32::from_le_bytes([b[1], b[2], b[3], b[4]]),
            length: u32::from_le_bytes([b[5], b[6], b[7], b[8]]),
            end: b[9] != 0,
        };
        Ok((slice, &b[Self::LEN..]))
    }
}

/// Descriptor of a HID device behind the aggregator (target category 0x15).
#[derive(Debug, Clone, Copy)]
pub struct HidDescriptor {
    pub instance_id: u8,
    /// 0 HID descriptor, 1 report descriptor, 2 device attributes.
    pub entry: u8,
}

impl HidDescriptor {
    pub const TARGET_CATEGORY: u8 = 0x15;
    pub const TARGET_ID: u8 = 0x02;
    pub const COMMAND_ID: u8 = 0x04;
    pub const DEFAULT_CHUNK_SIZE: u16 = 0x76;
}

impl ChunkSource for HidDescriptor {
    fn request(&self, offset: u32, len: u16) -> Request {
        let header = HidSlice {
            entry: self.entry,
            offset,
            length: u32::from(len),
            end: false,
        };
        Request::new(
            Self::TARGET_CATEGORY,
            Self::TARGET_ID,
            Self::COMMAND_ID,
            self.instance_id,
        )
        .with_flags(RequestFlags::HAS_RESPONSE)
        .with_payload(header.to_bytes())
    }

    fn parse<'r>(&self, response: &'r [u8]) -> Result<Chunk<'r>, ChunkError> {
        let (header, data) = HidSlice::parse(response)?;
        Ok(Chunk {
            size: header.length,
            end: header.end,
            data,
        })
    }
}

/// Controller firmware version query.
pub const FIRMWARE_VERSION: Command = Command::new(0x01, 0x01, 0x13, 0x00, RSP);

/// Firmware version as reported by [`FIRMWARE_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u16,
    pub patch: u8,
}

impl FirmwareVersion {
    pub fn request() -> Request {
        FIRMWARE_VERSION.request().with_response_capacity(4)
    }

    pub fn parse(response: &[u8]) -> Option<Self> {
        let raw: [u8; 4] = response.get(..4)?.try_into().ok()?;
        let v = u32::from_le_bytes(raw);
        Some(Self {
            major: (v >> 24) as u8,
            minor: ((v >> 8) & 0xffff) as u16,
            patch: (v & 0xff) as u8,
        })
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
