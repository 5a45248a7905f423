//! Frame encode/decode for the binary protocol.
//!
//! Classic frames use a 16-bit key length; flexible frames steal the high
//! key-length byte for a framing-extras length and are used whenever a
//! request carries framing extras (durability, preserve-expiry) or the
//! server echoes tracing information back.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use shoal_errors::{ErrorKind, ShoalError, ShoalResult};

use super::{DataType, DurabilityLevel, Magic, Opcode, Status};

pub const HEADER_SIZE: usize = 24;

const FRAME_ID_SERVER_DURATION: u8 = 0x00;
const FRAME_ID_DURABILITY: u8 = 0x01;
const FRAME_ID_PRESERVE_EXPIRY: u8 = 0x05;

/// An outgoing request, owned by the dispatcher until written.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub opcode: Opcode,
    pub datatype: DataType,
    pub vbucket_id: u16,
    pub opaque: u32,
    pub cas: u64,
    pub framing_extras: Vec<u8>,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl RequestFrame {
    pub fn new(opcode: Opcode) -> Self {
        RequestFrame {
            opcode,
            datatype: DataType::RAW,
            vbucket_id: 0,
            opaque: 0,
            cas: 0,
            framing_extras: Vec::new(),
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Append a durability framing extra. `timeout_ms` is the server-side
    /// deadline for the sync write; the dispatcher derives it from the
    /// operation deadline.
    pub fn add_durability(&mut self, level: DurabilityLevel, timeout_ms: Option<u16>) {
        if level == DurabilityLevel::None {
            return;
        }
        match timeout_ms {
            Some(timeout) => {
                self.framing_extras.push((FRAME_ID_DURABILITY << 4) | 3);
                self.framing_extras.push(level.code());
                self.framing_extras.extend_from_slice(&timeout.to_be_bytes());
            }
            None => {
                self.framing_extras.push((FRAME_ID_DURABILITY << 4) | 1);
                self.framing_extras.push(level.code());
            }
        }
    }

    pub fn add_preserve_expiry(&mut self) {
        self.framing_extras.push(FRAME_ID_PRESERVE_EXPIRY << 4);
    }

    pub fn encode(&self) -> Bytes {
        let body_len =
            self.framing_extras.len() + self.extras.len() + self.key.len() + self.value.len();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
        if self.framing_extras.is_empty() {
            buf.put_u8(Magic::Request as u8);
            buf.put_u8(self.opcode as u8);
            buf.put_u16(self.key.len() as u16);
        } else {
            buf.put_u8(Magic::FlexibleRequest as u8);
            buf.put_u8(self.opcode as u8);
            buf.put_u8(self.framing_extras.len() as u8);
            buf.put_u8(self.key.len() as u8);
        }
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.datatype.bits());
        buf.put_u16(self.vbucket_id);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.framing_extras);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        buf.freeze()
    }
}

/// A decoded server response.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub opcode: Option<Opcode>,
    pub raw_opcode: u8,
    pub datatype: u8,
    pub raw_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub framing_extras: Bytes,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl ResponseFrame {
    /// Split a full frame (header plus body) into its sections.
    pub fn decode(header: &[u8], mut body: Bytes) -> ShoalResult<ResponseFrame> {
        if header.len() != HEADER_SIZE {
            return Err(ShoalError::with_message(
                ErrorKind::ParsingFailure,
                "short binary protocol header",
            ));
        }
        let magic = Magic::parse(header[0]).ok_or_else(|| {
            ShoalError::with_message(
                ErrorKind::ParsingFailure,
                format!("unexpected magic byte 0x{:02x}", header[0]),
            )
        })?;
        if !magic.is_response() {
            return Err(ShoalError::with_message(
                ErrorKind::ParsingFailure,
                "request magic in response stream",
            ));
        }
        let (framing_len, key_len) = if magic == Magic::FlexibleResponse {
            (header[2] as usize, header[3] as usize)
        } else {
            (0, BigEndian::read_u16(&header[2..4]) as usize)
        };
        let extras_len = header[4] as usize;
        let datatype = header[5];
        let raw_status = BigEndian::read_u16(&header[6..8]);
        let body_len = BigEndian::read_u32(&header[8..12]) as usize;
        let opaque = BigEndian::read_u32(&header[12..16]);
        let cas = BigEndian::read_u64(&header[16..24]);

        if body.len() != body_len || framing_len + key_len + extras_len > body_len {
            return Err(ShoalError::with_message(
                ErrorKind::ParsingFailure,
                "binary protocol body length mismatch",
            ));
        }

        let framing_extras = body.split_to(framing_len);
        let extras = body.split_to(extras_len);
        let key = body.split_to(key_len);

        Ok(ResponseFrame {
            opcode: Opcode::parse(header[1]),
            raw_opcode: header[1],
            datatype,
            raw_status,
            opaque,
            cas,
            framing_extras,
            extras,
            key,
            value: body,
        })
    }

    pub fn status(&self) -> Option<Status> {
        Status::parse(self.raw_status)
    }

    /// Server-side processing time echoed in a tracing framing extra,
    /// decoded from its compressed wire form.
    pub fn server_duration_us(&self) -> Option<u64> {
        let mut rest = &self.framing_extras[..];
        while !rest.is_empty() {
            let id = rest[0] >> 4;
            let len = (rest[0] & 0x0f) as usize;
            if rest.len() < 1 + len {
                return None;
            }
            if id == FRAME_ID_SERVER_DURATION && len == 2 {
                let encoded = f64::from(BigEndian::read_u16(&rest[1..3]));
                return Some((encoded.powf(1.74) / 2.0) as u64);
            }
            rest = &rest[1 + len..];
        }
        None
    }
}
