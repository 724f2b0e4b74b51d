//! Length-prefixed binary frames.
//!
//! ```text
//! u32 BE body length | u8 tag | payload
//! ```
//!
//! Numbers in the payload are little-endian; text runs to the end of the
//! frame as UTF-8. Bodies larger than [`MAX_FRAME`] are rejected on both
//! sides.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use hhsim::comm::Message;
use hhsim::error::CommError;

pub const MAX_FRAME: usize = 1 << 20;

const LEN_BYTES: usize = 4;

const TAG_HELLO: u8 = 0x01;
const TAG_WELCOME: u8 = 0x02;
const TAG_ASSIGN: u8 = 0x10;
const TAG_SOMA_VOLTAGE: u8 = 0x11;
const TAG_CURRENT: u8 = 0x12;
const TAG_SHUTDOWN: u8 = 0x13;
const TAG_ABORT: u8 = 0x14;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Worker introduces itself to rank 0.
    Hello { rank: u32, size: u32 },
    /// Rank 0's reply: the group's run configuration as JSON.
    Welcome { config: String },
    /// A protocol message once the group is running.
    Msg(Message),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = CommError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CommError> {
        let start = dst.len();
        dst.put_u32(0);
        match frame {
            Frame::Hello { rank, size } => {
                dst.put_u8(TAG_HELLO);
                dst.put_u32_le(rank);
                dst.put_u32_le(size);
            }
            Frame::Welcome { config } => {
                dst.put_u8(TAG_WELCOME);
                dst.put_slice(config.as_bytes());
            }
            Frame::Msg(Message::Assign { first, count }) => {
                dst.put_u8(TAG_ASSIGN);
                dst.put_u64_le(first as u64);
                dst.put_u64_le(count as u64);
            }
            Frame::Msg(Message::SomaVoltage { step, mv }) => {
                dst.put_u8(TAG_SOMA_VOLTAGE);
                dst.put_u64_le(step);
                dst.put_f64_le(mv);
            }
            Frame::Msg(Message::Current { step, amps }) => {
                dst.put_u8(TAG_CURRENT);
                dst.put_u64_le(step);
                dst.put_f64_le(amps);
            }
            Frame::Msg(Message::Shutdown) => dst.put_u8(TAG_SHUTDOWN),
            Frame::Msg(Message::Abort { reason }) => {
                dst.put_u8(TAG_ABORT);
                dst.put_slice(reason.as_bytes());
            }
        }

        let len = dst.len() - start - LEN_BYTES;
        if len > MAX_FRAME {
            dst.truncate(start);
            return Err(CommError::Malformed(format!(
                "frame of {len} bytes exceeds {MAX_FRAME}"
            )));
        }
        dst[start..start + LEN_BYTES].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CommError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CommError> {
        if src.len() < LEN_BYTES {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_BYTES];
        len_bytes.copy_from_slice(&src[..LEN_BYTES]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 || len > MAX_FRAME {
            return Err(CommError::Malformed(format!("bad frame length {len}")));
        }
        if src.len() < LEN_BYTES + len {
            src.reserve(LEN_BYTES + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_BYTES);
        let body = src.split_to(len);
        decode_body(body).map(Some)
    }
}

fn decode_body(mut body: BytesMut) -> Result<Frame, CommError> {
    let tag = body.get_u8();
    let frame = match tag {
        TAG_HELLO => {
            need(&body, 8, "hello")?;
            Frame::Hello {
                rank: body.get_u32_le(),
                size: body.get_u32_le(),
            }
        }
        TAG_WELCOME => Frame::Welcome {
            config: take_text(&mut body)?,
        },
        TAG_ASSIGN => {
            need(&body, 16, "assign")?;
            Frame::Msg(Message::Assign {
                first: take_usize(&mut body)?,
                count: take_usize(&mut body)?,
            })
        }
        TAG_SOMA_VOLTAGE => {
            need(&body, 16, "soma-voltage")?;
            Frame::Msg(Message::SomaVoltage {
                step: body.get_u64_le(),
                mv: body.get_f64_le(),
            })
        }
        TAG_CURRENT => {
            need(&body, 16, "current")?;
            Frame::Msg(Message::Current {
                step: body.get_u64_le(),
                amps: body.get_f64_le(),
            })
        }
        TAG_SHUTDOWN => Frame::Msg(Message::Shutdown),
        TAG_ABORT => Frame::Msg(Message::Abort {
            reason: take_text(&mut body)?,
        }),
        other => return Err(CommError::Malformed(format!("unknown tag {other:#04x}"))),
    };

    if body.has_remaining() {
        return Err(CommError::Malformed(format!(
            "{} trailing bytes after tag {tag:#04x}",
            body.remaining()
        )));
    }
    Ok(frame)
}

fn need(body: &BytesMut, n: usize, what: &str) -> Result<(), CommError> {
    if body.remaining() < n {
        return Err(CommError::Malformed(format!(
            "{what} payload needs {n} bytes, got {}",
            body.remaining()
        )));
    }
    Ok(())
}

fn take_usize(body: &mut BytesMut) -> Result<usize, CommError> {
    let v = body.get_u64_le();
    usize::try_from(v).map_err(|_| CommError::Malformed(format!("index {v} out of range")))
}

fn take_text(body: &mut BytesMut) -> Result<String, CommError> {
    let bytes = body.split_to(body.len());
    String::from_utf8(bytes.to_vec())
        .map_err(|e| CommError::Malformed(format!("invalid UTF-8: {e}")))
}
