//! Length-prefixed binary framing for [`Command`].
//!
//! Layout is `u32 payload length | u8 tag | body`, everything big-endian.
//! Strings carry a `u16` byte length, point lists a `u16` count, options a
//! one-byte presence flag. The decoder consumes nothing until a whole frame
//! has arrived, so it is safe over a fragmenting TCP stream.

use tokio_util::codec::{Decoder, Encoder};
use bytes::{Buf, BufMut, BytesMut};
use std::io;

use tracing::warn;

use crate::{
    Color, Command, Point, RosterUpdate, Shape, ShapeKind, Stroke, TextBlock, Verdict,
};

const TAG_HELLO: u8 = 1;
const TAG_BYE: u8 = 2;
const TAG_CHAT: u8 = 3;
const TAG_AUTH: u8 = 4;
const TAG_KICK: u8 = 5;
const TAG_USER: u8 = 6;
const TAG_MGRINFO: u8 = 7;
const TAG_CLEAR: u8 = 8;
const TAG_STROKE: u8 = 9;
const TAG_SHAPE: u8 = 10;
const TAG_TEXT: u8 = 11;

const HEADER_LEN: usize = 4;
// a stroke maxes out at u16::MAX points of 8 bytes each, so 1 MiB is ample
const MAX_FRAME_LEN: usize = 1024 * 1024;

pub struct BoardCodec; // unit struct

impl Decoder for BoardCodec {
    type Item = Command;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if payload_len > MAX_FRAME_LEN {
            return Err(invalid("frame length exceeds limit"));
        }
        if src.len() < HEADER_LEN + payload_len {
            // wait for the rest of the frame
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut frame = src.split_to(payload_len);
        let cmd = decode_command(&mut frame)?;
        if frame.has_remaining() {
            return Err(invalid("trailing bytes in frame"));
        }
        Ok(Some(cmd))
    }
}

impl Encoder<Command> for BoardCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u32(0); // payload length backfilled below

        if let Err(e) = encode_command(&item, dst) {
            // an oversized field must not leave a half-written frame behind
            dst.truncate(start);
            return Err(e);
        }

        let payload_len = dst.len() - start - HEADER_LEN;
        if payload_len > MAX_FRAME_LEN {
            dst.truncate(start);
            return Err(invalid("frame length exceeds limit"));
        }
        dst[start..start + HEADER_LEN].copy_from_slice(&(payload_len as u32).to_be_bytes());
        Ok(())
    }
}

fn encode_command(item: &Command, dst: &mut BytesMut) -> io::Result<()> {
    match item {
        Command::Hello { username } => {
            dst.put_u8(TAG_HELLO);
            encode_str(username, dst)?;
        }
        Command::Bye { username, reason } => {
            dst.put_u8(TAG_BYE);
            encode_str(username, dst)?;
            encode_opt_str(reason.as_deref(), dst)?;
        }
        Command::Chat { username, text } => {
            dst.put_u8(TAG_CHAT);
            encode_str(username, dst)?;
            encode_str(text, dst)?;
        }
        Command::Auth { target, verdict } => {
            dst.put_u8(TAG_AUTH);
            encode_str(target, dst)?;
            match verdict {
                None => dst.put_u8(0),
                Some(Verdict::Yes) => dst.put_u8(1),
                Some(Verdict::No) => dst.put_u8(2),
            }
        }
        Command::Kick { target } => {
            dst.put_u8(TAG_KICK);
            encode_str(target, dst)?;
        }
        Command::User { update } => {
            dst.put_u8(TAG_USER);
            match update {
                RosterUpdate::Joined(name) => {
                    dst.put_u8(0);
                    encode_str(name, dst)?;
                }
                RosterUpdate::Full(names) => {
                    dst.put_u8(1);
                    dst.put_u16(checked_u16(names.len(), "roster too large")?);
                    for name in names {
                        encode_str(name, dst)?;
                    }
                }
            }
        }
        Command::MgrInfo { manager } => {
            dst.put_u8(TAG_MGRINFO);
            encode_str(manager, dst)?;
        }
        Command::Clear => {
            dst.put_u8(TAG_CLEAR);
        }
        Command::Stroke { stroke, author } => {
            dst.put_u8(TAG_STROKE);
            encode_stroke(stroke, dst)?;
            encode_opt_str(author.as_deref(), dst)?;
        }
        Command::Shape { shape, author } => {
            dst.put_u8(TAG_SHAPE);
            encode_shape(shape, dst);
            encode_opt_str(author.as_deref(), dst)?;
        }
        Command::Text { text, author } => {
            dst.put_u8(TAG_TEXT);
            encode_text(text, dst)?;
            encode_opt_str(author.as_deref(), dst)?;
        }
    }
    Ok(())
}

fn decode_command(src: &mut BytesMut) -> io::Result<Command> {
    match take_u8(src)? {
        TAG_HELLO => Ok(Command::Hello {
            username: decode_str(src)?,
        }),
        TAG_BYE => Ok(Command::Bye {
            username: decode_str(src)?,
            reason: decode_opt_str(src)?,
        }),
        TAG_CHAT => Ok(Command::Chat {
            username: decode_str(src)?,
            text: decode_str(src)?,
        }),
        TAG_AUTH => {
            let target = decode_str(src)?;
            let verdict = match take_u8(src)? {
                0 => None,
                1 => Some(Verdict::Yes),
                2 => Some(Verdict::No),
                _ => return Err(invalid("bad verdict byte")),
            };
            Ok(Command::Auth { target, verdict })
        }
        TAG_KICK => Ok(Command::Kick {
            target: decode_str(src)?,
        }),
        TAG_USER => {
            let update = match take_u8(src)? {
                0 => RosterUpdate::Joined(decode_str(src)?),
                1 => {
                    let count = take_u16(src)? as usize;
                    let mut names = Vec::with_capacity(count);
                    for _ in 0..count {
                        names.push(decode_str(src)?);
                    }
                    RosterUpdate::Full(names)
                }
                _ => return Err(invalid("bad roster update byte")),
            };
            Ok(Command::User { update })
        }
        TAG_MGRINFO => Ok(Command::MgrInfo {
            manager: decode_str(src)?,
        }),
        TAG_CLEAR => Ok(Command::Clear),
        TAG_STROKE => Ok(Command::Stroke {
            stroke: decode_stroke(src)?,
            author: decode_opt_str(src)?,
        }),
        TAG_SHAPE => Ok(Command::Shape {
            shape: decode_shape(src)?,
            author: decode_opt_str(src)?,
        }),
        TAG_TEXT => Ok(Command::Text {
            text: decode_text(src)?,
            author: decode_opt_str(src)?,
        }),
        tag => {
            warn!("dropping frame with unknown command tag {}", tag);
            Err(invalid("unknown command tag"))
        }
    }
}

fn encode_stroke(stroke: &Stroke, dst: &mut BytesMut) -> io::Result<()> {
    encode_color(stroke.color, dst);
    dst.put_f32(stroke.width);
    dst.put_u8(stroke.intermediate as u8);
    dst.put_u16(checked_u16(stroke.points.len(), "stroke has too many points")?);
    for p in &stroke.points {
        encode_point(*p, dst);
    }
    Ok(())
}

fn decode_stroke(src: &mut BytesMut) -> io::Result<Stroke> {
    let color = decode_color(src)?;
    let width = take_f32(src)?;
    let intermediate = take_bool(src)?;
    let count = take_u16(src)? as usize;
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        points.push(decode_point(src)?);
    }
    Ok(Stroke {
        color,
        width,
        points,
        intermediate,
    })
}

fn encode_shape(shape: &Shape, dst: &mut BytesMut) {
    let kind = match shape.kind {
        ShapeKind::Rectangle => 0u8,
        ShapeKind::Oval => 1,
        ShapeKind::Line => 2,
        ShapeKind::Triangle => 3,
    };
    dst.put_u8(kind);
    encode_point(shape.start, dst);
    encode_point(shape.end, dst);
    dst.put_f32(shape.width);
    encode_color(shape.color, dst);
    dst.put_u8(shape.intermediate as u8);
}

fn decode_shape(src: &mut BytesMut) -> io::Result<Shape> {
    let kind = match take_u8(src)? {
        0 => ShapeKind::Rectangle,
        1 => ShapeKind::Oval,
        2 => ShapeKind::Line,
        3 => ShapeKind::Triangle,
        _ => return Err(invalid("bad shape kind byte")),
    };
    let start = decode_point(src)?;
    let end = decode_point(src)?;
    let width = take_f32(src)?;
    let color = decode_color(src)?;
    let intermediate = take_bool(src)?;
    Ok(Shape {
        kind,
        start,
        end,
        width,
        color,
        intermediate,
    })
}

fn encode_text(text: &TextBlock, dst: &mut BytesMut) -> io::Result<()> {
    encode_str(&text.text, dst)?;
    encode_point(text.pos, dst);
    dst.put_u16(text.font_size);
    encode_color(text.color, dst);
    Ok(())
}

fn decode_text(src: &mut BytesMut) -> io::Result<TextBlock> {
    Ok(TextBlock {
        text: decode_str(src)?,
        pos: decode_point(src)?,
        font_size: take_u16(src)?,
        color: decode_color(src)?,
    })
}

fn encode_point(p: Point, dst: &mut BytesMut) {
    dst.put_i32(p.x);
    dst.put_i32(p.y);
}

fn decode_point(src: &mut BytesMut) -> io::Result<Point> {
    need(src, 8)?;
    Ok(Point {
        x: src.get_i32(),
        y: src.get_i32(),
    })
}

fn encode_color(c: Color, dst: &mut BytesMut) {
    dst.put_u8(c.r);
    dst.put_u8(c.g);
    dst.put_u8(c.b);
}

fn decode_color(src: &mut BytesMut) -> io::Result<Color> {
    need(src, 3)?;
    Ok(Color {
        r: src.get_u8(),
        g: src.get_u8(),
        b: src.get_u8(),
    })
}

// write str into BytesMut with a u16 length prefix
fn encode_str(s: &str, dst: &mut BytesMut) -> io::Result<()> {
    let len = checked_u16(s.len(), "string exceeds length prefix")?;
    dst.reserve(2 + s.len());
    dst.put_u16(len);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

// read a length-prefixed utf8 string out of BytesMut
fn decode_str(src: &mut BytesMut) -> io::Result<String> {
    let len = take_u16(src)? as usize;
    need(src, len)?;
    let bytes = src.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| invalid("invalid utf8"))
}

fn encode_opt_str(s: Option<&str>, dst: &mut BytesMut) -> io::Result<()> {
    match s {
        Some(s) => {
            dst.put_u8(1);
            encode_str(s, dst)?;
        }
        None => dst.put_u8(0),
    }
    Ok(())
}

fn decode_opt_str(src: &mut BytesMut) -> io::Result<Option<String>> {
    match take_u8(src)? {
        0 => Ok(None),
        1 => Ok(Some(decode_str(src)?)),
        _ => Err(invalid("bad option flag")),
    }
}

fn take_u8(src: &mut BytesMut) -> io::Result<u8> {
    need(src, 1)?;
    Ok(src.get_u8())
}

fn take_u16(src: &mut BytesMut) -> io::Result<u16> {
    need(src, 2)?;
    Ok(src.get_u16())
}

fn take_f32(src: &mut BytesMut) -> io::Result<f32> {
    need(src, 4)?;
    Ok(src.get_f32())
}

fn take_bool(src: &mut BytesMut) -> io::Result<bool> {
    match take_u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(invalid("bad bool byte")),
    }
}

fn checked_u16(len: usize, what: &str) -> io::Result<u16> {
    u16::try_from(len).map_err(|_| invalid(what))
}

fn need(src: &BytesMut, n: usize) -> io::Result<()> {
    if src.remaining() < n {
        return Err(invalid("frame body truncated"));
    }
    Ok(())
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
