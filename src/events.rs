//! Decoding of the kernel's asynchronous completion-event stream.
//!
//! Reading the DRM device fd yields a sequence of binary records, one per
//! completion the kernel has to report: `vblank` events for plain vertical
//! blanking notifications and `flip complete` events acknowledging an atomic
//! commit submitted with a page-flip event requested. Each record starts
//! with a generic header carrying a kind tag and the total record length;
//! the fixed payload follows immediately, and anything between the end of
//! the payload and the declared length is reserved and skipped.
//!
//! The decoder is strict where libdrm is forgiving: an unrecognized kind tag
//! means the kernel speaks a protocol version we do not, and is reported as
//! a [`DecodeError`] instead of being skipped. A truncated trailing record
//! is a protocol violation as well, since the kernel only ever delivers
//! whole records per read.

use crate::error::DecodeError;

/// `DRM_EVENT_VBLANK`
const EVENT_VBLANK: u32 = 0x01;
/// `DRM_EVENT_FLIP_COMPLETE`
const EVENT_FLIP_COMPLETE: u32 = 0x02;

/// Generic record header: kind tag + total record length, both native-endian
const HEADER_LEN: usize = 8;
/// Header plus the fixed payload shared by both recognized kinds
const RECORD_LEN: usize = 32;

/// The kind of a completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A vertical blanking interval began
    VBlank,
    /// A previously submitted atomic commit has taken visible effect
    FlipComplete,
}

/// One decoded completion event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventRecord {
    /// What completed
    pub kind: EventKind,
    /// The correlation token attached to the commit that caused this event
    pub user_data: u64,
    /// Monotonically increasing frame counter
    pub sequence: u32,
    /// Completion time in seconds, reconstructed from the seconds and
    /// microseconds fields of the record
    pub time: f64,
}

/// Lazy decoder over one raw read from the device fd.
///
/// Yields events in stream order. The first decode failure ends the
/// iteration; the remainder of the buffer is not inspected. An empty buffer
/// yields nothing, which is how the device signals end-of-available-data.
#[derive(Debug)]
pub struct Events<'a> {
    buffer: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Events<'a> {
    /// Creates a decoder over one read's worth of event bytes
    pub fn new(buffer: &'a [u8]) -> Events<'a> {
        Events {
            buffer,
            offset: 0,
            failed: false,
        }
    }

    fn decode_next(&mut self) -> Result<EventRecord, DecodeError> {
        let offset = self.offset;
        let available = self.buffer.len() - offset;

        if available < HEADER_LEN {
            return Err(DecodeError::Truncated {
                offset,
                expected: HEADER_LEN,
                available,
            });
        }

        let kind = read_u32(self.buffer, offset);
        let length = read_u32(self.buffer, offset + 4) as usize;

        let kind = match kind {
            EVENT_VBLANK => EventKind::VBlank,
            EVENT_FLIP_COMPLETE => EventKind::FlipComplete,
            kind => return Err(DecodeError::UnrecognizedKind { kind, offset }),
        };

        if length < RECORD_LEN {
            return Err(DecodeError::InvalidLength { offset, length });
        }
        if length > available {
            return Err(DecodeError::Truncated {
                offset,
                expected: length,
                available,
            });
        }

        let user_data = read_u64(self.buffer, offset + 8);
        let tv_sec = read_u32(self.buffer, offset + 16);
        let tv_usec = read_u32(self.buffer, offset + 20);
        let sequence = read_u32(self.buffer, offset + 24);
        // offset + 28 is reserved, and everything up to `length` with it

        self.offset += length;

        Ok(EventRecord {
            kind,
            user_data,
            sequence,
            time: tv_sec as f64 + tv_usec as f64 / 1_000_000.0,
        })
    }
}

impl Iterator for Events<'_> {
    type Item = Result<EventRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset == self.buffer.len() {
            return None;
        }

        let result = self.decode_next();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

#[inline]
fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buffer[offset..offset + 4].try_into().unwrap())
}

#[inline]
fn read_u64(buffer: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(buffer[offset..offset + 8].try_into().unwrap())
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode(kind: u32, length: u32, user_data: u64, sec: u32, usec: u32, seq: u32) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend_from_slice(&kind.to_ne_bytes());
        record.extend_from_slice(&length.to_ne_bytes());
        record.extend_from_slice(&user_data.to_ne_bytes());
        record.extend_from_slice(&sec.to_ne_bytes());
        record.extend_from_slice(&usec.to_ne_bytes());
        record.extend_from_slice(&seq.to_ne_bytes());
        record.extend_from_slice(&0u32.to_ne_bytes());
        record.resize(length as usize, 0);
        record
    }

    #[test]
    fn empty_read_yields_nothing() {
        assert_eq!(Events::new(&[]).count(), 0);
    }

    #[test]
    fn round_trip_preserves_order_and_fields() {
        let mut buffer = Vec::new();
        for seq in 0..16u32 {
            let kind = if seq % 2 == 0 { 0x02 } else { 0x01 };
            buffer.extend(encode(kind, 32, 0x4000_0000 + seq as u64, 100 + seq, seq * 250_000, seq));
        }

        let events = Events::new(&buffer)
            .collect::<Result<Vec<_>, _>>()
            .expect("well-formed stream");

        assert_eq!(events.len(), 16);
        for (seq, ev) in events.iter().enumerate() {
            let seq = seq as u32;
            let kind = if seq % 2 == 0 {
                EventKind::FlipComplete
            } else {
                EventKind::VBlank
            };
            assert_eq!(ev.kind, kind);
            assert_eq!(ev.user_data, 0x4000_0000 + seq as u64);
            assert_eq!(ev.sequence, seq);
            assert_eq!(ev.time, (100 + seq) as f64 + (seq * 250_000) as f64 / 1_000_000.0);
        }
    }

    #[test]
    fn trailing_reserved_bytes_are_skipped() {
        // 48-byte records: the 16 bytes past the fixed payload are reserved
        let mut buffer = encode(0x02, 48, 1, 0, 0, 7);
        buffer.extend(encode(0x02, 32, 2, 0, 0, 8));

        let events = Events::new(&buffer)
            .collect::<Result<Vec<_>, _>>()
            .expect("padding within the declared length is valid");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 7);
        assert_eq!(events[1].sequence, 8);
    }

    #[test]
    fn truncated_tail_is_an_error() {
        let mut buffer = encode(0x01, 32, 1, 0, 0, 1);
        buffer.extend(encode(0x02, 32, 2, 0, 0, 2));

        for cut in 1..32 {
            let short = &buffer[..buffer.len() - cut];
            let results: Vec<_> = Events::new(short).collect();
            // the first record still decodes, the partial one never does
            assert_eq!(results.len(), 2);
            assert_eq!(results[0].as_ref().unwrap().sequence, 1);
            assert!(matches!(results[1], Err(DecodeError::Truncated { .. })));
        }
    }

    #[test]
    fn unrecognized_kind_is_an_error() {
        let mut buffer = encode(0x02, 32, 1, 0, 0, 1);
        buffer.extend(encode(0x7f, 32, 2, 0, 0, 2));
        buffer.extend(encode(0x02, 32, 3, 0, 0, 3));

        let results: Vec<_> = Events::new(&buffer).collect();
        // decoding stops at the bad record, the rest of the buffer is not inspected
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(
            results[1],
            Err(DecodeError::UnrecognizedKind { kind: 0x7f, offset: 32 })
        );
    }

    #[test]
    fn impossible_length_is_an_error() {
        let buffer = encode(0x01, 16, 1, 0, 0, 1);
        let results: Vec<_> = Events::new(&buffer[..16]).collect();
        assert_eq!(
            results,
            vec![Err(DecodeError::InvalidLength { offset: 0, length: 16 })]
        );
    }

    #[test]
    fn length_past_buffer_end_is_an_error() {
        let buffer = encode(0x02, 64, 1, 0, 0, 1);
        let results: Vec<_> = Events::new(&buffer[..32]).collect();
        assert_eq!(
            results,
            vec![Err(DecodeError::Truncated {
                offset: 0,
                expected: 64,
                available: 32,
            })]
        );
    }
}
