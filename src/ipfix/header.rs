//! Fixed-size header structs (spec §3 "Template", RFC 7011 §3).
//!
//! Kept close to the teacher's `netflow/ipfix.rs`: fixed-width headers are
//! decoded with `bincode`'s big-endian fixint options rather than hand-rolled
//! `from_be_bytes` calls, exactly as the teacher does for `IpfixHeader` and
//! `IpfixSetHeader`. Variable-length template/data bodies (which `bincode`
//! cannot express) are walked by hand in `codec.rs`, the way the teacher's
//! `threads/listener.rs::parse_ipfix_msg` walks set bodies by offset.

use bincode::Options as _;
use serde::Deserialize;

use crate::error::MalformedRecordError;

pub const IPFIX_VERSION: u16 = 10;
pub const TEMPLATE_SET_ID: u16 = 2;
pub const OPTION_TEMPLATE_SET_ID: u16 = 3;
pub const DATA_SET_ID_MIN: u16 = 256;

pub const MESSAGE_HEADER_SIZE: usize = 16;
pub const SET_HEADER_SIZE: usize = 4;
pub const TEMPLATE_RECORD_HEADER_SIZE: usize = 4;
pub const TEMPLATE_FIELD_SPECIFIER_SIZE: usize = 4;
pub const ENTERPRISE_FIELD_SPECIFIER_SIZE: usize = 8;

fn big_endian_fixint() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_fixint_encoding().allow_trailing_bytes().with_big_endian()
}

/// RFC 7011 §3.1
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |       Version Number          |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Export Time                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Sequence Number                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Observation Domain ID                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct MessageHeader {
    pub version: u16,
    pub length: u16,
    pub export_time: u32,
    pub sequence_number: u32,
    pub observation_domain_id: u32,
}

impl MessageHeader {
    pub fn read(buf: &[u8]) -> Result<Self, MalformedRecordError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(MalformedRecordError::Truncated { need: MESSAGE_HEADER_SIZE, have: buf.len() });
        }
        let header: MessageHeader = big_endian_fixint()
            .deserialize(&buf[0..MESSAGE_HEADER_SIZE])
            .map_err(|e| MalformedRecordError::BadHeader(e.to_string()))?;
        if header.version != IPFIX_VERSION {
            return Err(MalformedRecordError::BadHeader(format!("unexpected version {}", header.version)));
        }
        Ok(header)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(&self.export_time.to_be_bytes());
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.observation_domain_id.to_be_bytes());
    }
}

/// RFC 7011 §3.3.2
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          Set ID               |          Length               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct SetHeader {
    pub set_id: u16,
    pub length: u16,
}

impl SetHeader {
    pub fn read(buf: &[u8]) -> Result<Self, MalformedRecordError> {
        if buf.len() < SET_HEADER_SIZE {
            return Err(MalformedRecordError::Truncated { need: SET_HEADER_SIZE, have: buf.len() });
        }
        big_endian_fixint().deserialize(&buf[0..SET_HEADER_SIZE]).map_err(|e| MalformedRecordError::BadHeader(e.to_string()))
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.set_id.to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn content_len(&self) -> usize {
        (self.length as usize).saturating_sub(SET_HEADER_SIZE)
    }
}

/// RFC 7011 §3.4.1 template record header: template id + field count, each a
/// `u16`, followed by `field_count` field specifiers.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct TemplateRecordHeader {
    pub template_id: u16,
    pub field_count: u16,
}

impl TemplateRecordHeader {
    pub fn read(buf: &[u8]) -> Result<Self, MalformedRecordError> {
        if buf.len() < TEMPLATE_RECORD_HEADER_SIZE {
            return Err(MalformedRecordError::Truncated { need: TEMPLATE_RECORD_HEADER_SIZE, have: buf.len() });
        }
        big_endian_fixint().deserialize(&buf[0..TEMPLATE_RECORD_HEADER_SIZE]).map_err(|e| MalformedRecordError::BadHeader(e.to_string()))
    }
}
