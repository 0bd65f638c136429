//! Framing: decode a captured byte stream into records, and encode records back.
//!
//! Frame layout:
//!
//! ```text
//! data:    AA 55 | ctrl (4) | crc (2) | cmd (8) | payload (ctrl.len - 8) | crc (2)
//! control: AA 55 | ctrl (4) | crc (2) | FF FF
//! ```

use std::iter::FusedIterator;

use crate::checksum;
use crate::protocol::{
    FrameCmd, FrameCtrl, FrameKind, Record, CMD_LEN, CRC_LEN, CTRL_LEN, SYN, TERMINATOR,
};

/// Decoder settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderOptions {
    /// Check frame checksums instead of skipping them.
    pub verify_checksums: bool,
}

/// Unrecoverable framing error. Offsets are relative to the start of the input.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated frame at offset {offset}: need {needed} byte(s), {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("expected terminator after control frame at offset {offset} ({ctrl:?}), found {found:02x?}")]
    MissingTerminator {
        offset: usize,
        ctrl: FrameCtrl,
        found: Vec<u8>,
    },
    #[error("unknown frame type 0x{:02x} at offset {offset} ({ctrl:?})", .ctrl.ty)]
    UnknownFrameType { offset: usize, ctrl: FrameCtrl },
    #[error("data frame at offset {offset} declares length {} shorter than the command header", .ctrl.len)]
    InvalidLength { offset: usize, ctrl: FrameCtrl },
    #[error("checksum mismatch at offset {offset}: expected {expected:04x}, found {found:04x}")]
    Checksum {
        offset: usize,
        expected: u16,
        found: u16,
    },
}

/// Cursor over the captured byte stream.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    options: DecoderOptions,
    resyncs: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_options(data, DecoderOptions::default())
    }

    pub fn with_options(data: &'a [u8], options: DecoderOptions) -> Self {
        Self {
            data,
            pos: 0,
            options,
            resyncs: 0,
        }
    }

    /// Number of times the stream had to be resynchronized.
    pub fn resyncs(&self) -> usize {
        self.resyncs
    }

    /// Current offset into the input.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decode the next frame. `Ok(None)` once the input is exhausted.
    ///
    /// Errors are fatal: the rest of the input is dropped and later calls return `Ok(None)`.
    pub fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        let result = self.decode_frame();
        if result.is_err() {
            self.pos = self.data.len();
        }
        result
    }

    fn decode_frame(&mut self) -> Result<Option<Record>, DecodeError> {
        if !self.sync() {
            return Ok(None);
        }
        let frame_start = self.pos - SYN.len();

        let ctrl_bytes: [u8; CTRL_LEN] = self.take_array()?;
        let ctrl = FrameCtrl::from_bytes(ctrl_bytes);
        self.checksum(&ctrl_bytes)?;

        match ctrl.kind() {
            Some(FrameKind::Data) => {
                let len = usize::from(ctrl.len);
                if len < CMD_LEN {
                    return Err(DecodeError::InvalidLength {
                        offset: frame_start,
                        ctrl,
                    });
                }
                let body = self.take(len)?;
                let cmd = FrameCmd::from_bytes(array(&body[..CMD_LEN]));
                let payload = body[CMD_LEN..].to_vec();
                self.checksum(body)?;
                log::trace!(
                    "data frame at {frame_start}: seq {} tc 0x{:02x} cid 0x{:02x} rqid {} ({} byte payload)",
                    ctrl.seq,
                    cmd.tc,
                    cmd.cid,
                    cmd.rqid(),
                    payload.len()
                );
                Ok(Some(Record::Data { ctrl, cmd, payload }))
            }
            Some(FrameKind::Control) => {
                let found = self.take(TERMINATOR.len())?;
                if found != TERMINATOR {
                    return Err(DecodeError::MissingTerminator {
                        offset: frame_start,
                        ctrl,
                        found: found.to_vec(),
                    });
                }
                log::trace!("control frame at {frame_start}: type 0x{:02x} seq {}", ctrl.ty, ctrl.seq);
                Ok(Some(Record::Control { ctrl }))
            }
            None => Err(DecodeError::UnknownFrameType {
                offset: frame_start,
                ctrl,
            }),
        }
    }

    /// Consume the SYN marker, skipping ahead to the next one if it is not where expected.
    /// Returns false if no further marker exists; trailing bytes are then discarded.
    fn sync(&mut self) -> bool {
        let rest = &self.data[self.pos..];
        if rest.is_empty() {
            return false;
        }
        if rest.starts_with(&SYN) {
            self.pos += SYN.len();
            return true;
        }
        self.resyncs += 1;
        match rest.windows(SYN.len()).position(|w| w == SYN) {
            Some(skip) => {
                log::warn!(
                    "expected SYN at offset {}, skipping {skip} byte(s) to next SYN",
                    self.pos
                );
                self.pos += skip + SYN.len();
                true
            }
            None => {
                log::warn!(
                    "expected SYN at offset {}, no further SYN; discarding {} trailing byte(s)",
                    self.pos,
                    rest.len()
                );
                self.pos = self.data.len();
                false
            }
        }
    }

    /// Skip a 2-byte checksum, verifying it against `covered` if enabled.
    fn checksum(&mut self, covered: &[u8]) -> Result<(), DecodeError> {
        let offset = self.pos;
        let wire: [u8; CRC_LEN] = self.take_array()?;
        if self.options.verify_checksums && !checksum::verify(covered, wire) {
            return Err(DecodeError::Checksum {
                offset,
                expected: checksum::crc16(covered),
                found: u16::from_le_bytes(wire),
            });
        }
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.remaining();
        if available < n {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
                available,
            });
        }
        let data: &'a [u8] = self.data;
        let out = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        self.take(N).map(array)
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

impl FusedIterator for Decoder<'_> {}

fn array<const N: usize>(b: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(b);
    out
}

/// Decode all records in `data`, stopping at the first fatal error.
pub fn decode_records(data: &[u8]) -> Result<Vec<Record>, DecodeError> {
    decode_records_with(data, DecoderOptions::default())
}

pub fn decode_records_with(data: &[u8], options: DecoderOptions) -> Result<Vec<Record>, DecodeError> {
    Decoder::with_options(data, options).collect()
}

/// Error encoding a record into a frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {0} bytes does not fit the length field")]
    TooLarge(usize),
    #[error("frame type 0x{0:02x} does not match the record kind")]
    KindMismatch(u8),
}

/// Encode a record as a frame with freshly computed checksums.
///
/// For data records `ctrl.len` is recomputed from the payload.
pub fn encode_record(record: &Record) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    out.extend_from_slice(&SYN);
    match record {
        Record::Data { ctrl, cmd, payload } => {
            if ctrl.kind() != Some(FrameKind::Data) {
                return Err(EncodeError::KindMismatch(ctrl.ty));
            }
            let len = u8::try_from(CMD_LEN + payload.len())
                .map_err(|_| EncodeError::TooLarge(payload.len()))?;
            let ctrl = FrameCtrl { len, ..*ctrl }.to_bytes();
            out.extend_from_slice(&ctrl);
            out.extend_from_slice(&checksum::crc16_bytes(&ctrl));

            let body_start = out.len();
            out.extend_from_slice(&cmd.to_bytes());
            out.extend_from_slice(payload);
            let crc = checksum::crc16_bytes(&out[body_start..]);
            out.extend_from_slice(&crc);
        }
        Record::Control { ctrl } => {
            if ctrl.kind() != Some(FrameKind::Control) {
                return Err(EncodeError::KindMismatch(ctrl.ty));
            }
            let ctrl = ctrl.to_bytes();
            out.extend_from_slice(&ctrl);
            out.extend_from_slice(&checksum::crc16_bytes(&ctrl));
            out.extend_from_slice(&TERMINATOR);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame_type;
    use rand::Rng;

    fn data_record(seq: u8, payload: &[u8]) -> Record {
        Record::Data {
            ctrl: FrameCtrl {
                ty: frame_type::DATA_SEQ,
                len: (CMD_LEN + payload.len()) as u8,
                pad: 0,
                seq,
            },
            cmd: FrameCmd {
                ty: 0x80,
                tc: 0x11,
                outgoing: 0x01,
                incoming: 0x00,
                iid: 0x00,
                rqid_lo: 0x05,
                rqid_hi: 0x00,
                cid: 0x0c,
            },
            payload: payload.to_vec(),
        }
    }

    fn ack(seq: u8) -> Record {
        Record::Control {
            ctrl: FrameCtrl {
                ty: frame_type::ACK,
                len: 0,
                pad: 0,
                seq,
            },
        }
    }

    #[test]
    fn decodes_data_frame_fields() {
        let bytes = [
            0xaa, 0x55, // SYN
            0x80, 0x0d, 0x00, 0x01, // ctrl: type, len = 8 + 5, pad, seq
            0x12, 0x34, // checksum (skipped)
            0x80, 0x11, 0x01, 0x00, 0x00, 0x05, 0x00, 0x0c, // cmd
            0x11, 0x01, 0x06, 0x00, 0x05, // payload
            0xcc, 0xcc, // checksum (skipped)
        ];
        let records = decode_records(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        let Record::Data { ctrl, cmd, payload } = &records[0] else {
            panic!("expected data record");
        };
        assert_eq!(*ctrl, FrameCtrl { ty: 0x80, len: 0x0d, pad: 0, seq: 1 });
        assert_eq!(cmd.tc, 0x11);
        assert_eq!(cmd.outgoing, 0x01);
        assert_eq!(cmd.rqid_lo, 0x05);
        assert_eq!(cmd.cid, 0x0c);
        assert_eq!(payload, &[0x11, 0x01, 0x06, 0x00, 0x05]);
        assert_eq!(payload.len(), usize::from(ctrl.len) - CMD_LEN);
    }

    #[test]
    fn decodes_terminator_frame() {
        let records = decode_records(&[0xaa, 0x55, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff]).unwrap();
        assert_eq!(records, vec![Record::Control { ctrl: FrameCtrl { ty: 0x40, len: 0, pad: 0, seq: 0 } }]);
    }

    #[test]
    fn nak_is_control_frame() {
        let records = decode_records(&[0xaa, 0x55, 0x04, 0x00, 0x00, 0x03, 0x00, 0x00, 0xff, 0xff]).unwrap();
        assert_eq!(records[0].ctrl().ty, frame_type::NAK);
        assert!(records[0].cmd().is_none());
    }

    #[test]
    fn reencode_roundtrip() {
        let records = vec![data_record(1, &[1, 2, 3]), ack(1), data_record(2, &[]), ack(2)];
        let mut stream = Vec::new();
        for r in &records {
            stream.extend(encode_record(r).unwrap());
        }
        let opts = DecoderOptions { verify_checksums: true };
        assert_eq!(decode_records_with(&stream, opts).unwrap(), records);
    }

    #[test]
    fn garbage_before_syn_is_skipped() {
        let mut rng = rand::thread_rng();
        let clean: Vec<u8> = [data_record(3, &[9, 8, 7]), ack(3)]
            .iter()
            .flat_map(|r| encode_record(r).unwrap())
            .collect();
        // 0xaa never appears, so the garbage can't contain a SYN
        let garbage: Vec<u8> = (0..rng.gen_range(1..32))
            .map(|_| rng.gen_range(0x00..0xaa))
            .collect();
        let dirty = [garbage, clean.clone()].concat();

        let mut dec = Decoder::new(&dirty);
        let from_dirty: Vec<Record> = (&mut dec).collect::<Result<_, _>>().unwrap();
        assert_eq!(dec.resyncs(), 1);
        assert_eq!(from_dirty, decode_records(&clean).unwrap());
    }

    #[test]
    fn garbage_between_frames_is_skipped() {
        let a = encode_record(&ack(1)).unwrap();
        let b = encode_record(&data_record(2, &[0x42])).unwrap();
        let stream = [a, vec![0x01, 0x02, 0x03], b].concat();
        let records = decode_records(&stream).unwrap();
        assert_eq!(records, vec![ack(1), data_record(2, &[0x42])]);
    }

    #[test]
    fn trailing_garbage_without_syn_is_discarded() {
        let stream = [encode_record(&ack(4)).unwrap(), vec![0x00, 0x13, 0x37]].concat();
        assert_eq!(decode_records(&stream).unwrap(), vec![ack(4)]);
    }

    #[test]
    fn missing_terminator_is_fatal() {
        let err = decode_records(&[0xaa, 0x55, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34]).unwrap_err();
        match err {
            DecodeError::MissingTerminator { offset, ctrl, found } => {
                assert_eq!(offset, 0);
                assert_eq!(ctrl.ty, 0x40);
                assert_eq!(found, vec![0x12, 0x34]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn decoding_stops_after_fatal_error() {
        let mut bytes = vec![0xaa, 0x55, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34];
        bytes.extend(encode_record(&ack(9)).unwrap());
        let mut decoder = Decoder::new(&bytes);
        assert!(matches!(
            decoder.next(),
            Some(Err(DecodeError::MissingTerminator { .. }))
        ));
        assert!(decoder.next().is_none());
        assert!(decoder.next().is_none());
        assert_eq!(decoder.position(), bytes.len());
    }

    #[test]
    fn truncated_payload_is_fatal() {
        let full = encode_record(&data_record(1, &[1, 2, 3, 4])).unwrap();
        let err = decode_records(&full[..full.len() - 3]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));

        let err = decode_records(&full[..full.len() - 1]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { needed: 2, available: 1, .. }));
    }

    #[test]
    fn truncated_control_header_is_fatal() {
        let err = decode_records(&[0xaa, 0x55, 0x40, 0x00]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { offset: 2, needed: 4, available: 2 }));
    }

    #[test]
    fn unknown_type_is_fatal() {
        let err = decode_records(&[0xaa, 0x55, 0x17, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownFrameType { ctrl, .. } if ctrl.ty == 0x17));
    }

    #[test]
    fn short_data_length_is_fatal() {
        let err = decode_records(&[0xaa, 0x55, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 1, 2, 3, 4, 0, 0]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidLength { .. }));
    }

    #[test]
    fn checksum_verification_is_opt_in() {
        let mut frame = encode_record(&data_record(5, &[0xde, 0xad])).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        assert_eq!(decode_records(&frame).unwrap().len(), 1);
        let err = decode_records_with(&frame, DecoderOptions { verify_checksums: true }).unwrap_err();
        assert!(matches!(err, DecodeError::Checksum { .. }));
    }

    #[test]
    fn random_payload_lengths_hold_invariant() {
        let mut rng = rand::thread_rng();
        let records: Vec<Record> = (0..16)
            .map(|seq| {
                let n = rng.gen_range(0..=(255 - CMD_LEN));
                let payload: Vec<u8> = (0..n).map(|_| rng.gen()).collect();
                data_record(seq, &payload)
            })
            .collect();
        let stream: Vec<u8> = records.iter().flat_map(|r| encode_record(r).unwrap()).collect();
        for r in decode_records(&stream).unwrap() {
            let payload = r.payload().unwrap();
            assert_eq!(payload.len(), usize::from(r.ctrl().len) - CMD_LEN);
        }
    }

    #[test]
    fn encode_rejects_oversized_and_mismatched() {
        let big = data_record(0, &[0u8; 300]);
        assert!(matches!(encode_record(&big), Err(EncodeError::TooLarge(300))));

        let wrong = Record::Control {
            ctrl: FrameCtrl { ty: frame_type::DATA_NSQ, len: 0, pad: 0, seq: 0 },
        };
        assert!(matches!(encode_record(&wrong), Err(EncodeError::KindMismatch(0x00))));
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(decode_records(&[]).unwrap().is_empty());
    }
}
