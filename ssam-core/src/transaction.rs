//! Request/response transactions through the aggregator debug device.
//!
//! A [`Request`] is marshaled into a [`RawRequest`], the fixed 40-byte structure the
//! kernel driver reads and writes back. The host supplies the actual device-control
//! call through [`Transport`]; [`Controller`] owns it and maps the returned status.

use std::io;

/// Well-known path of the aggregator debug device.
pub const DEVICE_PATH: &str = "/dev/surface/aggregator";

/// Default response capacity of a request.
pub const DEFAULT_RESPONSE_CAPACITY: usize = 1024;
/// Largest response the length field can describe.
pub const MAX_RESPONSE_CAPACITY: usize = u16::MAX as usize;
/// Largest payload the length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Size of [`RawRequest`] on the wire.
pub const RAW_REQUEST_SIZE: usize = 40;

/// Device-control code for "submit request": `_IOWR(0xA5, 1, struct ssam_cdev_request)`.
pub const IOCTL_REQUEST: u32 = iowr(0xa5, 1, RAW_REQUEST_SIZE as u32);

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn iowr(ty: u32, nr: u32, size: u32) -> u32 {
    ((IOC_WRITE | IOC_READ) << 30) | (size << 16) | (ty << 8) | nr
}

/// Status written before submission; a driver that never touches the buffer reports this.
const STATUS_UNTOUCHED: i16 = -6; // -ENXIO

/// Request flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFlags(u16);

impl RequestFlags {
    pub const NONE: Self = Self(0);
    /// The controller sends a response.
    pub const HAS_RESPONSE: Self = Self(0x01);
    /// Send without a sequence number (no ACK expected).
    pub const UNSEQUENCED: Self = Self(0x02);

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RequestFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One request to the embedded controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub target_category: u8,
    pub target_id: u8,
    pub command_id: u8,
    pub instance_id: u8,
    pub flags: RequestFlags,
    pub payload: Vec<u8>,
    /// Requested maximum response size; clamped to [`MAX_RESPONSE_CAPACITY`] on submission.
    pub response_capacity: usize,
}

impl Request {
    pub fn new(target_category: u8, target_id: u8, command_id: u8, instance_id: u8) -> Self {
        Self {
            target_category,
            target_id,
            command_id,
            instance_id,
            flags: RequestFlags::NONE,
            payload: Vec::new(),
            response_capacity: DEFAULT_RESPONSE_CAPACITY,
        }
    }

    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_response_capacity(mut self, capacity: usize) -> Self {
        self.response_capacity = capacity;
        self
    }

    /// Response capacity as it will be submitted.
    pub fn clamped_capacity(&self) -> usize {
        self.response_capacity.min(MAX_RESPONSE_CAPACITY)
    }
}

/// Field offsets of `struct ssam_cdev_request` (native endian, 8-byte aligned):
///
/// ```text
///  0  u8   target_category      16  u16  payload.length
///  1  u8   target_id            18  [6]  padding
///  2  u8   command_id           24  u64  response.data
///  3  u8   instance_id          32  u16  response.length
///  4  u16  flags                34  [6]  padding
///  6  i16  status
///  8  u64  payload.data
/// ```
mod layout {
    pub const TARGET_CATEGORY: usize = 0;
    pub const TARGET_ID: usize = 1;
    pub const COMMAND_ID: usize = 2;
    pub const INSTANCE_ID: usize = 3;
    pub const FLAGS: usize = 4;
    pub const STATUS: usize = 6;
    pub const PAYLOAD_DATA: usize = 8;
    pub const PAYLOAD_LENGTH: usize = 16;
    pub const RESPONSE_DATA: usize = 24;
    pub const RESPONSE_LENGTH: usize = 32;
}

/// Raw transaction buffer, bound to the payload and response memory it points at.
///
/// The descriptor addresses stay valid for `'a`, which covers exactly one submission.
pub struct RawRequest<'a> {
    bytes: [u8; RAW_REQUEST_SIZE],
    payload: &'a [u8],
    response: &'a mut [u8],
}

impl<'a> RawRequest<'a> {
    /// Marshal `rqst`. `payload` and `response` back the two data descriptors;
    /// empty slices produce null/zero descriptors.
    pub fn new(rqst: &Request, payload: &'a [u8], response: &'a mut [u8]) -> Self {
        let mut raw = Self {
            bytes: [0; RAW_REQUEST_SIZE],
            payload,
            response,
        };
        raw.bytes[layout::TARGET_CATEGORY] = rqst.target_category;
        raw.bytes[layout::TARGET_ID] = rqst.target_id;
        raw.bytes[layout::COMMAND_ID] = rqst.command_id;
        raw.bytes[layout::INSTANCE_ID] = rqst.instance_id;
        raw.put_u16(layout::FLAGS, rqst.flags.bits());
        raw.set_status(STATUS_UNTOUCHED);

        let (addr, len) = descriptor(raw.payload.as_ptr() as usize, raw.payload.len());
        raw.put_u64(layout::PAYLOAD_DATA, addr);
        raw.put_u16(layout::PAYLOAD_LENGTH, len);

        // The device writes through this address, so it comes from the mutable borrow.
        let (addr, len) = descriptor(raw.response.as_mut_ptr() as usize, raw.response.len());
        raw.put_u64(layout::RESPONSE_DATA, addr);
        raw.put_u16(layout::RESPONSE_LENGTH, len);
        raw
    }

    /// Buffer handed to the device-control call.
    pub fn as_mut_bytes(&mut self) -> &mut [u8; RAW_REQUEST_SIZE] {
        &mut self.bytes
    }

    pub fn as_bytes(&self) -> &[u8; RAW_REQUEST_SIZE] {
        &self.bytes
    }

    pub fn target_category(&self) -> u8 {
        self.bytes[layout::TARGET_CATEGORY]
    }

    pub fn target_id(&self) -> u8 {
        self.bytes[layout::TARGET_ID]
    }

    pub fn command_id(&self) -> u8 {
        self.bytes[layout::COMMAND_ID]
    }

    pub fn instance_id(&self) -> u8 {
        self.bytes[layout::INSTANCE_ID]
    }

    pub fn flags(&self) -> RequestFlags {
        RequestFlags::from_bits(self.get_u16(layout::FLAGS))
    }

    pub fn status(&self) -> i16 {
        i16::from_ne_bytes([self.bytes[layout::STATUS], self.bytes[layout::STATUS + 1]])
    }

    pub fn set_status(&mut self, status: i16) {
        self.bytes[layout::STATUS..layout::STATUS + 2].copy_from_slice(&status.to_ne_bytes());
    }

    pub fn payload_address(&self) -> u64 {
        self.get_u64(layout::PAYLOAD_DATA)
    }

    pub fn payload_length(&self) -> u16 {
        self.get_u16(layout::PAYLOAD_LENGTH)
    }

    pub fn response_address(&self) -> u64 {
        self.get_u64(layout::RESPONSE_DATA)
    }

    pub fn response_length(&self) -> u16 {
        self.get_u16(layout::RESPONSE_LENGTH)
    }

    /// Set the number of valid response bytes, as the driver does on completion.
    pub fn set_response_length(&mut self, len: u16) {
        self.put_u16(layout::RESPONSE_LENGTH, len);
    }

    /// Payload memory the payload descriptor points at.
    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    /// Response memory the response descriptor points at.
    pub fn response_buffer(&mut self) -> &mut [u8] {
        &mut *self.response
    }

    fn get_u16(&self, at: usize) -> u16 {
        u16::from_ne_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    fn put_u16(&mut self, at: usize, v: u16) {
        self.bytes[at..at + 2].copy_from_slice(&v.to_ne_bytes());
    }

    fn get_u64(&self, at: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.bytes[at..at + 8]);
        u64::from_ne_bytes(b)
    }

    fn put_u64(&mut self, at: usize, v: u64) {
        self.bytes[at..at + 8].copy_from_slice(&v.to_ne_bytes());
    }
}

fn descriptor(addr: usize, len: usize) -> (u64, u16) {
    if len == 0 {
        (0, 0)
    } else {
        (addr as u64, u16::try_from(len).unwrap_or(u16::MAX))
    }
}

/// Device-control channel. One blocking call per transaction.
pub trait Transport {
    /// Submit the raw request and block until the driver completes it.
    ///
    /// An `Err` means the call itself failed; a failed request is reported
    /// through the status field instead.
    fn submit(&mut self, raw: &mut RawRequest<'_>) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn submit(&mut self, raw: &mut RawRequest<'_>) -> io::Result<()> {
        (**self).submit(raw)
    }
}

/// Error of a single transaction.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("controller is not open")]
    NotOpen,
    #[error("payload of {0} bytes exceeds the 65535 byte limit")]
    PayloadTooLarge(usize),
    #[error("device control call failed: {0}")]
    Io(#[from] io::Error),
    #[error("request failed with status {status}: {}", status_error(.status))]
    Status { status: i16 },
    #[error("driver reported {reported} response bytes for a {capacity} byte buffer")]
    ResponseOverflow { reported: usize, capacity: usize },
}

impl TransactionError {
    /// OS error corresponding to a failed request or call.
    pub fn os_error(&self) -> Option<io::Error> {
        match self {
            TransactionError::Status { status } => Some(status_error(status)),
            TransactionError::Io(e) => e.raw_os_error().map(io::Error::from_raw_os_error),
            _ => None,
        }
    }

    /// Timeout-class failures may be retried.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransactionError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            TransactionError::Status { .. } => self
                .os_error()
                .is_some_and(|e| e.kind() == io::ErrorKind::TimedOut),
            _ => false,
        }
    }
}

/// Status values are negated errno codes.
fn status_error(status: &i16) -> io::Error {
    io::Error::from_raw_os_error(-i32::from(*status))
}

/// Exclusive owner of the device channel; one transaction at a time.
pub struct Controller<T: Transport> {
    transport: Option<T>,
}

impl<T: Transport> Controller<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Release the channel. Later requests fail with [`TransactionError::NotOpen`].
    pub fn close(&mut self) -> Option<T> {
        self.transport.take()
    }

    /// Run one transaction.
    ///
    /// Returns `Ok(None)` when the driver reports no response bytes; an empty
    /// `Some` is never produced.
    pub fn request(&mut self, rqst: &Request) -> Result<Option<Vec<u8>>, TransactionError> {
        let transport = self.transport.as_mut().ok_or(TransactionError::NotOpen)?;
        if rqst.payload.len() > MAX_PAYLOAD_LEN {
            return Err(TransactionError::PayloadTooLarge(rqst.payload.len()));
        }

        let capacity = rqst.clamped_capacity();
        let mut response = vec![0u8; capacity];
        let mut raw = RawRequest::new(rqst, &rqst.payload, &mut response);

        log::debug!(
            "request tc 0x{:02x} tid 0x{:02x} cid 0x{:02x} iid 0x{:02x} flags 0x{:02x} ({} byte payload, {} byte response)",
            rqst.target_category,
            rqst.target_id,
            rqst.command_id,
            rqst.instance_id,
            rqst.flags.bits(),
            rqst.payload.len(),
            capacity
        );
        transport.submit(&mut raw)?;

        let status = raw.status();
        if status != 0 {
            return Err(TransactionError::Status { status });
        }
        let len = usize::from(raw.response_length());
        drop(raw);

        if len == 0 {
            return Ok(None);
        }
        if len > capacity {
            return Err(TransactionError::ResponseOverflow {
                reported: len,
                capacity,
            });
        }
        response.truncate(len);
        Ok(Some(response))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Reply, Scripted};
    use super::*;

    #[test]
    fn ioctl_code_matches_driver() {
        assert_eq!(IOCTL_REQUEST, 0xc028_a501);
    }

    #[test]
    fn marshal_identity_fields() {
        let rqst = Request::new(0x11, 0x01, 0x0c, 0x02).with_flags(RequestFlags::HAS_RESPONSE);
        let mut rsp = [0u8; 4];
        let raw = RawRequest::new(&rqst, &[], &mut rsp);
        let b = raw.as_bytes();
        assert_eq!(&b[0..4], &[0x11, 0x01, 0x0c, 0x02]);
        assert_eq!(raw.flags(), RequestFlags::HAS_RESPONSE);
        assert_eq!(raw.status(), -6);
        assert_eq!(&b[18..24], &[0; 6]);
        assert_eq!(&b[34..40], &[0; 6]);
    }

    #[test]
    fn empty_payload_and_zero_capacity_give_null_descriptors() {
        let rqst = Request::new(0x11, 0x01, 0x06, 0x00).with_response_capacity(0);
        let payload = rqst.payload.clone();
        let mut rsp = vec![0u8; rqst.clamped_capacity()];
        let raw = RawRequest::new(&rqst, &payload, &mut rsp);
        assert_eq!(raw.payload_address(), 0);
        assert_eq!(raw.payload_length(), 0);
        assert_eq!(raw.response_address(), 0);
        assert_eq!(raw.response_length(), 0);
    }

    #[test]
    fn descriptors_point_at_bound_buffers() {
        let rqst = Request::new(0x08, 0x02, 0x00, 0x00).with_payload(vec![1, 2, 3]);
        let mut rsp = vec![0u8; 16];
        let rsp_addr = rsp.as_ptr() as usize as u64;
        let raw = RawRequest::new(&rqst, &rqst.payload, &mut rsp);
        assert_eq!(raw.payload_address(), rqst.payload.as_ptr() as usize as u64);
        assert_eq!(raw.payload_length(), 3);
        assert_eq!(raw.response_address(), rsp_addr);
        assert_eq!(raw.response_length(), 16);

        let b = raw.as_bytes();
        let payload_addr = rqst.payload.as_ptr() as usize as u64;
        assert_eq!(&b[8..16], &payload_addr.to_ne_bytes());
        assert_eq!(&b[16..18], &3u16.to_ne_bytes());
        assert_eq!(&b[24..32], &rsp_addr.to_ne_bytes());
        assert_eq!(&b[32..34], &16u16.to_ne_bytes());
    }

    #[test]
    fn capacity_is_clamped() {
        let rqst = Request::new(0, 0, 0, 0).with_response_capacity(100_000);
        assert_eq!(rqst.clamped_capacity(), 65535);

        let mut ctrl = Controller::new(Scripted::new([Reply::Ignore]));
        let _ = ctrl.request(&rqst);
        let t = ctrl.close().unwrap();
        assert_eq!(t.seen[0].6, 65535);
    }

    #[test]
    fn oversized_payload_is_rejected_before_submit() {
        let mut ctrl = Controller::new(Scripted::default());
        let rqst = Request::new(0x08, 0x02, 0x01, 0x00).with_payload(vec![0; MAX_PAYLOAD_LEN + 1]);
        let err = ctrl.request(&rqst).unwrap_err();
        assert!(matches!(err, TransactionError::PayloadTooLarge(65536)));
        assert!(ctrl.close().unwrap().seen.is_empty());
    }

    #[test]
    fn overlong_response_length_is_rejected() {
        let mut ctrl = Controller::new(Scripted::new([Reply::Overflow]));
        let rqst = Request::new(0x01, 0x01, 0x13, 0x00).with_response_capacity(4);
        let err = ctrl.request(&rqst).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::ResponseOverflow {
                reported: 5,
                capacity: 4
            }
        ));
    }

    #[test]
    fn response_bytes_returned() {
        let mut ctrl = Controller::new(Scripted::new([Reply::Data(vec![0x00, 0x01, 0x02, 0x03])]));
        let rqst = Request::new(0x01, 0x01, 0x13, 0x00).with_response_capacity(4);
        assert_eq!(ctrl.request(&rqst).unwrap(), Some(vec![0, 1, 2, 3]));
    }

    #[test]
    fn zero_length_response_is_none() {
        let mut ctrl = Controller::new(Scripted::new([Reply::Data(vec![])]));
        assert_eq!(ctrl.request(&Request::new(0x11, 0x01, 0x06, 0x00)).unwrap(), None);
    }

    #[test]
    fn payload_is_visible_to_transport() {
        let mut ctrl = Controller::new(Scripted::new([Reply::Data(vec![])]));
        let rqst = Request::new(0x08, 0x02, 0x01, 0x00).with_payload(vec![0x01]);
        ctrl.request(&rqst).unwrap();
        let t = ctrl.close().unwrap();
        assert_eq!(t.seen[0].5, vec![0x01]);
    }

    #[test]
    fn negative_status_names_os_error() {
        let mut ctrl = Controller::new(Scripted::new([Reply::Status(-6)]));
        let err = ctrl.request(&Request::new(0x11, 0x01, 0x06, 0x00)).unwrap_err();
        assert!(matches!(err, TransactionError::Status { status: -6 }));
        let os = err.os_error().unwrap();
        assert_eq!(os.raw_os_error(), Some(6));
        assert!(err.to_string().contains(&os.to_string()));
        assert!(!err.is_timeout());
    }

    #[test]
    fn untouched_buffer_is_an_error() {
        let mut ctrl = Controller::new(Scripted::new([Reply::Ignore]));
        let err = ctrl.request(&Request::new(0x11, 0x01, 0x06, 0x00)).unwrap_err();
        assert!(matches!(err, TransactionError::Status { status: -6 }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn etimedout_is_timeout_class() {
        let mut ctrl = Controller::new(Scripted::new([Reply::Status(-110)]));
        let err = ctrl.request(&Request::new(0x0c, 0x01, 0x0c, 0x00)).unwrap_err();
        assert!(err.is_timeout());
        assert!(TransactionError::Io(io::Error::from(io::ErrorKind::TimedOut)).is_timeout());
    }

    #[test]
    fn closed_controller_rejects_requests() {
        let mut ctrl = Controller::new(Scripted::default());
        assert!(ctrl.is_open());
        ctrl.close();
        let err = ctrl.request(&Request::new(0, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, TransactionError::NotOpen));
    }

    #[test]
    fn transport_failure_propagates() {
        let mut ctrl = Controller::new(Scripted::default());
        let err = ctrl.request(&Request::new(0, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, TransactionError::Io(_)));
    }
}
