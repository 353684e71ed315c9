//! RFC 6455 frame codec: parsing, masking, fragmentation reassembly, and
//! the handshake accept digest.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

pub const WS_ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_CONTROL_PAYLOAD: u64 = 125;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WsError {
    #[error("websocket protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsDirection {
    ClientToServer,
    ServerToClient,
}

impl WsDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToServer => "client_to_server",
            Self::ServerToClient => "server_to_client",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        self.to_wire() & 0x8 != 0
    }
}

/// One decoded frame. The payload is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameParse {
    /// Fewer bytes available than the declared frame length requires.
    Incomplete,
    Frame { frame: Frame, consumed: usize },
}

/// Decode one frame from the front of `buf`. Masking discipline is enforced
/// per direction: client frames must be masked, server frames must not be.
pub fn parse_frame(buf: &[u8], direction: WsDirection) -> Result<FrameParse, WsError> {
    if buf.len() < 2 {
        return Ok(FrameParse::Incomplete);
    }

    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(WsError::ProtocolViolation("reserved bits set"));
    }
    let opcode = Opcode::from_wire(buf[0] & 0x0F)
        .ok_or(WsError::ProtocolViolation("unknown opcode"))?;

    let masked = buf[1] & 0x80 != 0;
    match direction {
        WsDirection::ClientToServer if !masked => {
            return Err(WsError::ProtocolViolation("client frame is not masked"))
        }
        WsDirection::ServerToClient if masked => {
            return Err(WsError::ProtocolViolation("server frame is masked"))
        }
        _ => {}
    }

    let len7 = (buf[1] & 0x7F) as u64;
    let (payload_len, mut offset) = match len7 {
        126 => {
            let Some(bytes) = buf.get(2..4) else {
                return Ok(FrameParse::Incomplete);
            };
            (u16::from_be_bytes([bytes[0], bytes[1]]) as u64, 4)
        }
        127 => {
            let Some(bytes) = buf.get(2..10) else {
                return Ok(FrameParse::Incomplete);
            };
            let mut raw = [0_u8; 8];
            raw.copy_from_slice(bytes);
            let length = u64::from_be_bytes(raw);
            if length & (1 << 63) != 0 {
                return Err(WsError::ProtocolViolation(
                    "payload length uses the reserved high bit",
                ));
            }
            (length, 10)
        }
        short => (short, 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(WsError::ProtocolViolation("fragmented control frame"));
        }
        if payload_len > MAX_CONTROL_PAYLOAD {
            return Err(WsError::ProtocolViolation(
                "control frame payload exceeds 125 bytes",
            ));
        }
    }

    let mask_key = if masked {
        let Some(bytes) = buf.get(offset..offset + 4) else {
            return Ok(FrameParse::Incomplete);
        };
        let mut key = [0_u8; 4];
        key.copy_from_slice(bytes);
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len_usize = usize::try_from(payload_len)
        .map_err(|_| WsError::ProtocolViolation("payload length exceeds addressable memory"))?;
    let Some(payload_bytes) = buf.get(offset..offset + payload_len_usize) else {
        return Ok(FrameParse::Incomplete);
    };

    let mut payload = payload_bytes.to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(FrameParse::Frame {
        frame: Frame {
            fin,
            opcode,
            masked,
            payload,
        },
        consumed: offset + payload_len_usize,
    })
}

/// XOR each payload byte with `key[i mod 4]`. Involutive: applying twice
/// restores the original bytes.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[index % 4];
    }
}

/// Serialize a frame, masking the payload when a key is supplied.
pub fn build_frame(fin: bool, opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    let fin_bit = if fin { 0x80 } else { 0x00 };
    frame.push(fin_bit | opcode.to_wire());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let payload_len = payload.len() as u64;
    if payload_len <= 125 {
        frame.push(mask_bit | payload_len as u8);
    } else if payload_len <= u16::MAX as u64 {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&payload_len.to_be_bytes());
    }

    match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            let mut masked = payload.to_vec();
            apply_mask(&mut masked, key);
            frame.extend_from_slice(&masked);
        }
        None => frame.extend_from_slice(payload),
    }
    frame
}

/// `base64(SHA1(client_key || MAGIC))` per RFC 6455 §4.2.2.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_ACCEPT_MAGIC.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembledMessage {
    /// A data message completed by this frame (possibly reassembled from
    /// several fragments).
    Complete { opcode: Opcode, payload: Vec<u8> },
    /// A control frame, passed through even mid-fragmentation.
    Control { opcode: Opcode, payload: Vec<u8> },
    /// A fragment was buffered; nothing to surface yet.
    Pending,
}

/// Per-connection fragmentation state: the in-flight data opcode plus the
/// accumulated payload.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    in_flight: Option<Opcode>,
    buffer: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: &Frame) -> Result<AssembledMessage, WsError> {
        if frame.opcode.is_control() {
            return Ok(AssembledMessage::Control {
                opcode: frame.opcode,
                payload: frame.payload.clone(),
            });
        }

        match frame.opcode {
            Opcode::Continuation => {
                let Some(opcode) = self.in_flight else {
                    return Err(WsError::ProtocolViolation(
                        "continuation frame without an open message",
                    ));
                };
                self.buffer.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.in_flight = None;
                    Ok(AssembledMessage::Complete {
                        opcode,
                        payload: std::mem::take(&mut self.buffer),
                    })
                } else {
                    Ok(AssembledMessage::Pending)
                }
            }
            opcode => {
                if self.in_flight.is_some() {
                    return Err(WsError::ProtocolViolation(
                        "data frame interleaved with a fragmented message",
                    ));
                }
                if frame.fin {
                    return Ok(AssembledMessage::Complete {
                        opcode,
                        payload: frame.payload.clone(),
                    });
                }
                self.in_flight = Some(opcode);
                self.buffer = frame.payload.clone();
                Ok(AssembledMessage::Pending)
            }
        }
    }
}
