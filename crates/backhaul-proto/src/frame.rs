//! Control-channel frame codec
//!
//! Every control-channel message carries exactly one frame:
//!
//! ```text
//! byte 0       : opcode (0x01=CONNECT, 0x02=DATA, 0x03=CLOSE)
//! bytes 1..16  : request id, high 64 bits then low 64 bits, big-endian
//! bytes 17..N  : payload (DATA only)
//! ```
//!
//! There is no length field: the payload runs to the end of the message.
//! Payloads that would push a frame past the configured maximum are split
//! into consecutive DATA frames and the receiver concatenates them in
//! arrival order.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{RequestId, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN};

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Connect = 0x01,
    Data = 0x02,
    Close = 0x03,
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Opcode::Connect),
            0x02 => Ok(Opcode::Data),
            0x03 => Ok(Opcode::Close),
            _ => Err(FrameError::UnknownOpcode(value)),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Opcode::Connect => "CONNECT",
            Opcode::Data => "DATA",
            Opcode::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// Frame codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame: {0} bytes is shorter than the 17-byte header")]
    TooShort(usize),

    #[error("Malformed frame: unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Payload of {payload} bytes exceeds the {max_payload}-byte limit")]
    PayloadTooLarge { payload: usize, max_payload: usize },

    #[error("Maximum frame size {0} leaves no room for a payload")]
    InvalidMaxFrameSize(usize),
}

impl FrameError {
    /// True for the conditions that mean "drop this message and keep the channel"
    pub fn is_malformed(&self) -> bool {
        matches!(self, FrameError::TooShort(_) | FrameError::UnknownOpcode(_))
    }
}

/// A decoded control-channel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect { request_id: RequestId },
    Data { request_id: RequestId, payload: Bytes },
    Close { request_id: RequestId },
}

impl Frame {
    pub fn connect(request_id: RequestId) -> Self {
        Frame::Connect { request_id }
    }

    pub fn data(request_id: RequestId, payload: impl Into<Bytes>) -> Self {
        Frame::Data {
            request_id,
            payload: payload.into(),
        }
    }

    pub fn close(request_id: RequestId) -> Self {
        Frame::Close { request_id }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Connect { .. } => Opcode::Connect,
            Frame::Data { .. } => Opcode::Data,
            Frame::Close { .. } => Opcode::Close,
        }
    }

    pub fn request_id(&self) -> RequestId {
        match self {
            Frame::Connect { request_id }
            | Frame::Data { request_id, .. }
            | Frame::Close { request_id } => *request_id,
        }
    }

    /// Total encoded length including the header
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Data { payload, .. } => HEADER_LEN + payload.len(),
            _ => HEADER_LEN,
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Data {
                request_id,
                payload,
            } => encode_data(*request_id, payload),
            other => encode_operation(other.request_id(), other.opcode()),
        }
    }

    /// Decode frame from one control-channel message
    ///
    /// Trailing bytes on CONNECT and CLOSE carry no meaning and are ignored.
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::TooShort(buf.len()));
        }

        let opcode = Opcode::try_from(buf[0])?;
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[1..HEADER_LEN]);
        let request_id = RequestId::from_bytes(id);

        Ok(match opcode {
            Opcode::Connect => Frame::Connect { request_id },
            Opcode::Close => Frame::Close { request_id },
            Opcode::Data => Frame::Data {
                request_id,
                payload: buf.split_off(HEADER_LEN),
            },
        })
    }
}

fn put_header(buf: &mut BytesMut, request_id: RequestId, opcode: Opcode) {
    buf.put_u8(opcode as u8);
    buf.put_slice(request_id.as_bytes());
}

/// Encode a header-only frame (CONNECT or CLOSE)
pub fn encode_operation(request_id: RequestId, opcode: Opcode) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    put_header(&mut buf, request_id, opcode);
    buf.freeze()
}

/// Encode a DATA frame carrying `payload`
pub fn encode_data(request_id: RequestId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    put_header(&mut buf, request_id, Opcode::Data);
    buf.put_slice(payload);
    buf.freeze()
}

/// Frame codec bound to a maximum frame size.
///
/// Both ends of a control channel must use the same maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Result<Self, FrameError> {
        if max_frame_size <= HEADER_LEN {
            return Err(FrameError::InvalidMaxFrameSize(max_frame_size));
        }
        Ok(Self { max_frame_size })
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Largest payload a single DATA frame may carry
    pub fn max_payload(&self) -> usize {
        self.max_frame_size - HEADER_LEN
    }

    pub fn encode_operation(&self, request_id: RequestId, opcode: Opcode) -> Bytes {
        encode_operation(request_id, opcode)
    }

    /// Encode a single DATA frame, refusing payloads that do not fit
    pub fn encode_data(&self, request_id: RequestId, payload: &[u8]) -> Result<Bytes, FrameError> {
        if payload.len() > self.max_payload() {
            return Err(FrameError::PayloadTooLarge {
                payload: payload.len(),
                max_payload: self.max_payload(),
            });
        }
        Ok(encode_data(request_id, payload))
    }

    /// Split `payload` into DATA frames no larger than the maximum frame size.
    ///
    /// Frames are yielded in byte order. An empty payload yields no frames.
    pub fn encode_data_chunks<'a>(
        &self,
        request_id: RequestId,
        payload: &'a [u8],
    ) -> impl Iterator<Item = Bytes> + 'a {
        payload
            .chunks(self.max_payload())
            .map(move |chunk| encode_data(request_id, chunk))
    }

    pub fn decode(&self, buf: Bytes) -> Result<Frame, FrameError> {
        Frame::decode(buf)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
