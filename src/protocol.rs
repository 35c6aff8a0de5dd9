//! Tagged-union wire codec.
//!
//! A single decoder inspects a leading tag and returns one `WireMessage`
//! variant, matched exhaustively by both the capture pipeline's
//! control-message handler and the render pipeline's decode dispatch.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Cursor;

use crate::error::{Error, Result};

const TAG_TILES: &[u8] = b"TILES";
const TAG_NUMPY: &[u8] = b"NUMPY";
const TAG_DELTA: &[u8] = b"DELTA";
const TAG_NO_CHANGE: &[u8] = b"NO_CHANGE";
const TAG_SEND_SCREENSHOT: &[u8] = b"SEND_SCREENSHOT";
const TAG_SET_VAR: &[u8] = b"SET_VAR";
const TAG_NEW_COMMAND: &[u8] = b"NEW_COMMAND";
const TAG_NET_FEEDBACK: &[u8] = b"NET_FEEDBACK:";

/// `{"variable":K,"value":V}` body of a `SET_VAR` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVar {
    pub variable: String,
    pub value: Value,
}

/// Per-tile geometry plus the explicit body length the redesign requires.
#[derive(Debug, Clone, Copy)]
pub struct TileHeader {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub body_len: u32,
}

#[derive(Debug, Clone)]
pub struct EncodedTile {
    pub header: TileHeader,
    pub body: Vec<u8>,
}

/// The decoded form of every payload kind the wire tag can carry.
#[derive(Debug, Clone)]
pub enum WireMessage {
    TilesUpdate { quality: u32, fps_target: u32, tiles: Vec<EncodedTile> },
    NumpyUpdate { height: u32, width: u32, channels: u32, body: Vec<u8> },
    DeltaUpdate { x1: u32, y1: u32, x2: u32, y2: u32, body: Vec<u8> },
    NoChange,
    ScreenshotRequest,
    SetVar(SetVar),
    NewCommand(Vec<Value>),
    NetFeedback { delta: i32, fps: f64 },
}

fn strip_prefix<'a>(payload: &'a [u8], tag: &[u8]) -> Option<&'a [u8]> {
    payload.strip_prefix(tag)
}

impl WireMessage {
    pub fn decode(payload: &[u8]) -> Result<WireMessage> {
        if payload == TAG_NO_CHANGE {
            return Ok(WireMessage::NoChange);
        }
        if payload == TAG_SEND_SCREENSHOT {
            return Ok(WireMessage::ScreenshotRequest);
        }
        if let Some(rest) = strip_prefix(payload, TAG_TILES) {
            return decode_tiles(rest);
        }
        if let Some(rest) = strip_prefix(payload, TAG_NUMPY) {
            return decode_numpy(rest);
        }
        if let Some(rest) = strip_prefix(payload, TAG_DELTA) {
            return decode_delta(rest);
        }
        if let Some(rest) = strip_prefix(payload, TAG_SET_VAR) {
            let set_var: SetVar = serde_json::from_slice(rest)?;
            return Ok(WireMessage::SetVar(set_var));
        }
        if let Some(rest) = strip_prefix(payload, TAG_NEW_COMMAND) {
            let args: Vec<Value> = serde_json::from_slice(rest)?;
            return Ok(WireMessage::NewCommand(args));
        }
        if let Some(rest) = strip_prefix(payload, TAG_NET_FEEDBACK) {
            return decode_net_feedback(rest);
        }
        Err(Error::Decode("unrecognized message tag"))
    }

    pub fn encode_no_change() -> Vec<u8> {
        TAG_NO_CHANGE.to_vec()
    }

    pub fn encode_send_screenshot() -> Vec<u8> {
        TAG_SEND_SCREENSHOT.to_vec()
    }

    pub fn encode_tiles(quality: u32, fps_target: u32, tiles: &[EncodedTile]) -> Vec<u8> {
        let mut out = Vec::from(TAG_TILES);
        out.write_u32::<LittleEndian>(tiles.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(quality).unwrap();
        out.write_u32::<LittleEndian>(fps_target).unwrap();
        for tile in tiles {
            out.write_u32::<LittleEndian>(tile.header.x).unwrap();
            out.write_u32::<LittleEndian>(tile.header.y).unwrap();
            out.write_u32::<LittleEndian>(tile.header.w).unwrap();
            out.write_u32::<LittleEndian>(tile.header.h).unwrap();
            out.write_u32::<LittleEndian>(tile.body.len() as u32).unwrap();
            out.extend_from_slice(&tile.body);
        }
        out
    }

    pub fn encode_numpy(height: u32, width: u32, channels: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::from(TAG_NUMPY);
        out.write_u32::<LittleEndian>(height).unwrap();
        out.write_u32::<LittleEndian>(width).unwrap();
        out.write_u32::<LittleEndian>(channels).unwrap();
        out.extend_from_slice(body);
        out
    }

    pub fn encode_delta(x1: u32, y1: u32, x2: u32, y2: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::from(TAG_DELTA);
        out.write_u32::<LittleEndian>(x1).unwrap();
        out.write_u32::<LittleEndian>(y1).unwrap();
        out.write_u32::<LittleEndian>(x2).unwrap();
        out.write_u32::<LittleEndian>(y2).unwrap();
        out.extend_from_slice(body);
        out
    }

    pub fn encode_set_var(variable: &str, value: Value) -> Result<Vec<u8>> {
        let mut out = Vec::from(TAG_SET_VAR);
        let body = serde_json::to_vec(&SetVar { variable: variable.to_string(), value })?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn encode_new_command(args: &[Value]) -> Result<Vec<u8>> {
        let mut out = Vec::from(TAG_NEW_COMMAND);
        out.extend_from_slice(&serde_json::to_vec(args)?);
        Ok(out)
    }

    pub fn encode_net_feedback(delta: i32, fps: f64) -> Vec<u8> {
        format!("NET_FEEDBACK:{}:{:.2}", delta, fps).into_bytes()
    }
}

fn decode_tiles(rest: &[u8]) -> Result<WireMessage> {
    let mut cursor = Cursor::new(rest);
    let num_tiles = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated tiles header"))?;
    let quality = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated tiles header"))?;
    let fps_target = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated tiles header"))?;

    let mut tiles = Vec::with_capacity(num_tiles as usize);
    for _ in 0..num_tiles {
        let x = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated tile header"))?;
        let y = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated tile header"))?;
        let w = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated tile header"))?;
        let h = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated tile header"))?;
        let body_len = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated tile header"))?;

        let start = cursor.position() as usize;
        let end = start.checked_add(body_len as usize).ok_or(Error::Decode("tile body length overflow"))?;
        let body = rest.get(start..end).ok_or(Error::Decode("truncated tile body"))?.to_vec();
        cursor.set_position(end as u64);

        tiles.push(EncodedTile { header: TileHeader { x, y, w, h, body_len }, body });
    }
    Ok(WireMessage::TilesUpdate { quality, fps_target, tiles })
}

fn decode_numpy(rest: &[u8]) -> Result<WireMessage> {
    let mut cursor = Cursor::new(rest);
    let height = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated numpy header"))?;
    let width = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated numpy header"))?;
    let channels = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated numpy header"))?;
    let body = rest[(cursor.position() as usize)..].to_vec();
    Ok(WireMessage::NumpyUpdate { height, width, channels, body })
}

fn decode_delta(rest: &[u8]) -> Result<WireMessage> {
    let mut cursor = Cursor::new(rest);
    let x1 = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated delta header"))?;
    let y1 = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated delta header"))?;
    let x2 = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated delta header"))?;
    let y2 = cursor.read_u32::<LittleEndian>().map_err(|_| Error::Decode("truncated delta header"))?;
    let body = rest[(cursor.position() as usize)..].to_vec();
    Ok(WireMessage::DeltaUpdate { x1, y1, x2, y2, body })
}

fn decode_net_feedback(rest: &[u8]) -> Result<WireMessage> {
    let text = std::str::from_utf8(rest).map_err(|_| Error::Decode("non-utf8 feedback message"))?;
    let mut parts = text.splitn(2, ':');
    let delta: i32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::Decode("malformed feedback delta"))?;
    let fps: f64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::Decode("malformed feedback fps"))?;
    Ok(WireMessage::NetFeedback { delta, fps })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_change_round_trips() {
        let encoded = WireMessage::encode_no_change();
        assert!(matches!(WireMessage::decode(&encoded).unwrap(), WireMessage::NoChange));
    }

    #[test]
    fn set_var_round_trips() {
        let encoded = WireMessage::encode_set_var("fps", Value::from(30)).unwrap();
        match WireMessage::decode(&encoded).unwrap() {
            WireMessage::SetVar(set_var) => {
                assert_eq!(set_var.variable, "fps");
                assert_eq!(set_var.value, Value::from(30));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn new_command_round_trips() {
        let args = vec![Value::from("MoveMouse"), Value::from(0.5), Value::from(0.25)];
        let encoded = WireMessage::encode_new_command(&args).unwrap();
        match WireMessage::decode(&encoded).unwrap() {
            WireMessage::NewCommand(decoded) => assert_eq!(decoded, args),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn net_feedback_round_trips() {
        let encoded = WireMessage::encode_net_feedback(-10, 42.5);
        match WireMessage::decode(&encoded).unwrap() {
            WireMessage::NetFeedback { delta, fps } => {
                assert_eq!(delta, -10);
                assert!((fps - 42.5).abs() < 1e-6);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn tiles_round_trip_with_explicit_body_lengths() {
        let tiles = vec![
            EncodedTile { header: TileHeader { x: 0, y: 0, w: 64, h: 64, body_len: 3 }, body: vec![1, 2, 3] },
            EncodedTile { header: TileHeader { x: 64, y: 0, w: 64, h: 64, body_len: 2 }, body: vec![4, 5] },
        ];
        let encoded = WireMessage::encode_tiles(42, 60, &tiles);
        match WireMessage::decode(&encoded).unwrap() {
            WireMessage::TilesUpdate { quality, fps_target, tiles: decoded } => {
                assert_eq!(quality, 42);
                assert_eq!(fps_target, 60);
                assert_eq!(decoded.len(), 2);
                assert_eq!(decoded[0].body, vec![1, 2, 3]);
                assert_eq!(decoded[1].body, vec![4, 5]);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn unrecognized_tag_is_a_decode_error() {
        assert!(WireMessage::decode(b"GARBAGE").is_err());
    }
}
