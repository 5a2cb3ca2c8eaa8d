use std::fmt::{Display, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Every Blit frame starts with this signature, followed by a single opcode byte and the
///  opcode's payload. All multi-byte integers are big-endian.
pub const BLIT_SIGNATURE: &[u8; 3] = b"BLT";

const HEADER_LEN: usize = BLIT_SIGNATURE.len() + 1;
const PEER_INDEX_LEN: usize = 2;
const SENDMSG_PREFIX_LEN: usize = PEER_INDEX_LEN + 4;

/// upper limit for injected messages. The encoder refuses larger messages, and the decoder
///  rejects them instead of buffering them (see [BlitDecodeError::frame_len]).
pub const MAX_SENDMSG_LEN: u32 = 16*1024*1024; //TODO make this configurable

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BlitOpcode {
    Squelch = 0,
    Unsquelch = 1,
    Delete = 2,
    SendMsg = 5,
    ListPeers = 6,
    Clear = 0xfe,
    Kill = 0xff,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BlitCommand {
    Squelch { peer: u16 },
    Unsquelch { peer: u16 },
    Delete { peer: u16 },
    SendMsg { peer: u16, data: Bytes },
    ListPeers,
    Clear,
    Kill,
}

impl BlitCommand {
    pub fn opcode(&self) -> BlitOpcode {
        match self {
            BlitCommand::Squelch { .. } => BlitOpcode::Squelch,
            BlitCommand::Unsquelch { .. } => BlitOpcode::Unsquelch,
            BlitCommand::Delete { .. } => BlitOpcode::Delete,
            BlitCommand::SendMsg { .. } => BlitOpcode::SendMsg,
            BlitCommand::ListPeers => BlitOpcode::ListPeers,
            BlitCommand::Clear => BlitOpcode::Clear,
            BlitCommand::Kill => BlitOpcode::Kill,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        if let BlitCommand::SendMsg { data, .. } = self {
            let len = u32::try_from(data.len())
                .map_err(|_| anyhow!("message of {} bytes is too long for a Blit frame", data.len()))?;
            if len > MAX_SENDMSG_LEN {
                bail!("message of {} bytes exceeds the maximum of {}", len, MAX_SENDMSG_LEN);
            }
        }

        buf.put_slice(BLIT_SIGNATURE);
        buf.put_u8(self.opcode().into());
        match self {
            BlitCommand::Squelch { peer } |
            BlitCommand::Unsquelch { peer } |
            BlitCommand::Delete { peer } => buf.put_u16(*peer),
            BlitCommand::SendMsg { peer, data } => {
                buf.put_u16(*peer);
                // checked above
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            BlitCommand::ListPeers |
            BlitCommand::Clear |
            BlitCommand::Kill => {}
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf)?;
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BlitDecodeError {
    BadSignature,
    UnknownOpcode(u8),
    Oversized(u32),
}
impl BlitDecodeError {
    /// The length of the rejected frame if the error is confined to a single frame of known
    ///  length. A decoder can skip that many bytes and continue with the next frame; other
    ///  errors leave no way to find the next frame.
    pub fn frame_len(&self) -> Option<usize> {
        match self {
            BlitDecodeError::Oversized(len) => Some(HEADER_LEN + SENDMSG_PREFIX_LEN + *len as usize),
            BlitDecodeError::BadSignature |
            BlitDecodeError::UnknownOpcode(_) => None,
        }
    }
}

impl Display for BlitDecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BlitDecodeError::BadSignature => write!(f, "Bad signature"),
            BlitDecodeError::UnknownOpcode(op) => write!(f, "Unknown opcode 0x{:02x}", op),
            BlitDecodeError::Oversized(len) => write!(f, "Message length {} exceeds the maximum of {}", len, MAX_SENDMSG_LEN),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DecodeResult {
    /// A complete frame at the start of the buffer, which is `consumed` bytes long
    Complete { command: BlitCommand, consumed: usize },
    /// The buffer is a consistent prefix of a frame - more data is needed
    Incomplete,
    Error(BlitDecodeError),
}

/// Decodes the frame at the start of `buf`, which holds all bytes received so far that were not
///  consumed by earlier frames.
///
/// This is a pure function: it can be called again with the same bytes plus whatever arrived
///  in the meantime, and partial data is never mistaken for an error.
pub fn decode(buf: &[u8]) -> DecodeResult {
    let sig_len = buf.len().min(BLIT_SIGNATURE.len());
    if buf[..sig_len] != BLIT_SIGNATURE[..sig_len] {
        return DecodeResult::Error(BlitDecodeError::BadSignature);
    }
    if buf.len() < HEADER_LEN {
        return DecodeResult::Incomplete;
    }

    let opcode = match BlitOpcode::try_from(buf[BLIT_SIGNATURE.len()]) {
        Ok(opcode) => opcode,
        Err(_) => return DecodeResult::Error(BlitDecodeError::UnknownOpcode(buf[BLIT_SIGNATURE.len()])),
    };

    let mut payload = &buf[HEADER_LEN..];
    let (command, payload_len) = match opcode {
        BlitOpcode::Squelch | BlitOpcode::Unsquelch | BlitOpcode::Delete => {
            if payload.len() < PEER_INDEX_LEN {
                return DecodeResult::Incomplete;
            }
            let peer = payload.get_u16();
            let command = match opcode {
                BlitOpcode::Squelch => BlitCommand::Squelch { peer },
                BlitOpcode::Unsquelch => BlitCommand::Unsquelch { peer },
                _ => BlitCommand::Delete { peer },
            };
            (command, PEER_INDEX_LEN)
        }
        BlitOpcode::SendMsg => {
            if payload.len() < SENDMSG_PREFIX_LEN {
                return DecodeResult::Incomplete;
            }
            let peer = payload.get_u16();
            let len = payload.get_u32();
            if len > MAX_SENDMSG_LEN {
                return DecodeResult::Error(BlitDecodeError::Oversized(len));
            }
            let len = len as usize;
            if payload.len() < len {
                return DecodeResult::Incomplete;
            }
            let data = Bytes::copy_from_slice(&payload[..len]);
            (BlitCommand::SendMsg { peer, data }, SENDMSG_PREFIX_LEN + len)
        }
        BlitOpcode::ListPeers => (BlitCommand::ListPeers, 0),
        BlitOpcode::Clear => (BlitCommand::Clear, 0),
        BlitOpcode::Kill => (BlitCommand::Kill, 0),
    };

    DecodeResult::Complete {
        command,
        consumed: HEADER_LEN + payload_len,
    }
}
