//! Surface System Aggregator Module (SSAM) protocol toolkit.
//! Host-driven: no device I/O; the host supplies a [`Transport`] for live requests.

pub mod capture;
pub mod checksum;
pub mod commands;
pub mod frame;
pub mod protocol;
pub mod transaction;
pub mod transfer;

pub use capture::{extract_bytes, extract_from_reader, extract_from_slice};
pub use frame::{decode_records, encode_record, DecodeError, Decoder, DecoderOptions};
pub use protocol::{FrameCmd, FrameCtrl, Record};
pub use transaction::{
    Controller, RawRequest, Request, RequestFlags, TransactionError, Transport, DEVICE_PATH,
    IOCTL_REQUEST,
};
pub use transfer::{read_all, ChunkSource, RetryPolicy, TransferError};
