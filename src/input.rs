//! Input events: wire encoding/decoding as `NEW_COMMAND` JSON arrays,
//! relative-to-absolute coordinate mapping, and dispatch to OS input.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::collaborators::OsInput;
use crate::error::{Error, Result};

pub const MOVE_MOUSE_THROTTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    MoveMouse { rx: f64, ry: f64 },
    MouseInput { is_left: bool, is_down: bool },
    ScrollMouse { rx: f64, ry: f64, direction: i32, amount: i32 },
    KeyboardInput { keycode: u32, is_down: bool },
}

impl InputEvent {
    pub fn to_args(&self) -> Vec<Value> {
        match *self {
            InputEvent::MoveMouse { rx, ry } => vec![Value::from("MoveMouse"), Value::from(rx), Value::from(ry)],
            InputEvent::MouseInput { is_left, is_down } => {
                vec![Value::from("MouseInput"), Value::from(is_left), Value::from(is_down)]
            }
            InputEvent::ScrollMouse { rx, ry, direction, amount } => vec![
                Value::from("ScrollMouse"),
                Value::from(rx),
                Value::from(ry),
                Value::from(direction),
                Value::from(amount),
            ],
            InputEvent::KeyboardInput { keycode, is_down } => {
                vec![Value::from("KeyboardInput"), Value::from(keycode), Value::from(is_down)]
            }
        }
    }

    pub fn from_args(args: &[Value]) -> Result<InputEvent> {
        let name = args.first().and_then(Value::as_str).ok_or(Error::Decode("missing command name"))?;
        let arg = |i: usize| args.get(i).ok_or(Error::Decode("missing command argument"));
        match name {
            "MoveMouse" => Ok(InputEvent::MoveMouse {
                rx: arg(1)?.as_f64().ok_or(Error::Decode("bad MoveMouse arg"))?,
                ry: arg(2)?.as_f64().ok_or(Error::Decode("bad MoveMouse arg"))?,
            }),
            "MouseInput" => Ok(InputEvent::MouseInput {
                is_left: arg(1)?.as_bool().ok_or(Error::Decode("bad MouseInput arg"))?,
                is_down: arg(2)?.as_bool().ok_or(Error::Decode("bad MouseInput arg"))?,
            }),
            "ScrollMouse" => Ok(InputEvent::ScrollMouse {
                rx: arg(1)?.as_f64().ok_or(Error::Decode("bad ScrollMouse arg"))?,
                ry: arg(2)?.as_f64().ok_or(Error::Decode("bad ScrollMouse arg"))?,
                direction: arg(3)?.as_i64().ok_or(Error::Decode("bad ScrollMouse arg"))? as i32,
                amount: arg(4)?.as_i64().ok_or(Error::Decode("bad ScrollMouse arg"))? as i32,
            }),
            "KeyboardInput" => Ok(InputEvent::KeyboardInput {
                keycode: arg(1)?.as_u64().ok_or(Error::Decode("bad KeyboardInput arg"))? as u32,
                is_down: arg(2)?.as_bool().ok_or(Error::Decode("bad KeyboardInput arg"))?,
            }),
            _ => Err(Error::Decode("unrecognized input command")),
        }
    }
}

/// Converts a displayed-frame pixel position into a position relative to
/// the *source* frame, accounting for aspect-ratio letterboxing: the
/// image is centered within the display surface at the largest scale
/// that preserves its aspect ratio.
pub fn displayed_to_relative(u: f64, v: f64, displayed: (u32, u32), source: (u32, u32)) -> (f64, f64) {
    let (dw, dh) = (displayed.0 as f64, displayed.1 as f64);
    let (sw, sh) = (source.0 as f64, source.1 as f64);
    if sw == 0.0 || sh == 0.0 || dw == 0.0 || dh == 0.0 {
        return (0.0, 0.0);
    }

    let source_aspect = sw / sh;
    let display_aspect = dw / dh;
    let (content_w, content_h, offset_x, offset_y) = if display_aspect > source_aspect {
        let content_h = dh;
        let content_w = content_h * source_aspect;
        ((content_w), content_h, (dw - content_w) / 2.0, 0.0)
    } else {
        let content_w = dw;
        let content_h = content_w / source_aspect;
        (content_w, content_h, 0.0, (dh - content_h) / 2.0)
    };

    let rx = ((u - offset_x) / content_w).clamp(0.0, 1.0);
    let ry = ((v - offset_y) / content_h).clamp(0.0, 1.0);
    (rx, ry)
}

/// Converts a relative position back to absolute source-frame pixels.
pub fn relative_to_absolute(rx: f64, ry: f64, source: (u32, u32)) -> (i32, i32) {
    (
        (rx * source.0 as f64).round() as i32,
        (ry * source.1 as f64).round() as i32,
    )
}

/// Throttles `MoveMouse` to at most one per `MOVE_MOUSE_THROTTLE`; other
/// events always pass through.
pub struct InputThrottle {
    last_move: Option<Instant>,
}

impl InputThrottle {
    pub fn new() -> Self {
        InputThrottle { last_move: None }
    }

    pub fn should_send(&mut self, event: &InputEvent) -> bool {
        if !matches!(event, InputEvent::MoveMouse { .. }) {
            return true;
        }
        let now = Instant::now();
        match self.last_move {
            Some(last) if now.duration_since(last) < MOVE_MOUSE_THROTTLE => false,
            _ => {
                self.last_move = Some(now);
                true
            }
        }
    }
}

impl Default for InputThrottle {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies one decoded input event to the OS, converting relative
/// coordinates to absolute screen-space using the current source extent.
pub fn apply_event(event: &InputEvent, source_extent: (u32, u32), os_input: &mut dyn OsInput) -> Result<()> {
    match *event {
        InputEvent::MoveMouse { rx, ry } => {
            let (x, y) = relative_to_absolute(rx, ry, source_extent);
            os_input.move_mouse(x, y)
        }
        InputEvent::MouseInput { is_left, is_down } => os_input.mouse_button(is_left, is_down),
        InputEvent::ScrollMouse { rx, ry, direction, amount } => {
            let (x, y) = relative_to_absolute(rx, ry, source_extent);
            os_input.scroll(x, y, direction != 0, amount)
        }
        InputEvent::KeyboardInput { keycode, is_down } => os_input.key(keycode, is_down),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_mouse_round_trips_through_args() {
        let event = InputEvent::MoveMouse { rx: 0.25, ry: 0.75 };
        let args = event.to_args();
        assert_eq!(InputEvent::from_args(&args).unwrap(), event);
    }

    #[test]
    fn scroll_mouse_round_trips_through_args() {
        let event = InputEvent::ScrollMouse { rx: 0.1, ry: 0.2, direction: -1, amount: 3 };
        let args = event.to_args();
        assert_eq!(InputEvent::from_args(&args).unwrap(), event);
    }

    #[test]
    fn relative_to_absolute_scales_by_source_extent() {
        assert_eq!(relative_to_absolute(0.5, 0.5, (1920, 1080)), (960, 540));
    }

    #[test]
    fn displayed_to_relative_handles_matching_aspect_ratio() {
        let (rx, ry) = displayed_to_relative(960.0, 540.0, (1920, 1080), (1920, 1080));
        assert!((rx - 0.5).abs() < 1e-9);
        assert!((ry - 0.5).abs() < 1e-9);
    }

    #[test]
    fn displayed_to_relative_accounts_for_letterboxing() {
        // Source is 2:1 but displayed in a square window: vertical bars.
        let (rx, ry) = displayed_to_relative(500.0, 500.0, (1000, 1000), (200, 100));
        assert!((rx - 0.5).abs() < 1e-9);
        assert!((ry - 0.5).abs() < 1e-9);
    }

    #[test]
    fn throttle_drops_rapid_move_mouse_events() {
        let mut throttle = InputThrottle::new();
        let event = InputEvent::MoveMouse { rx: 0.1, ry: 0.1 };
        assert!(throttle.should_send(&event));
        assert!(!throttle.should_send(&event));
    }

    #[test]
    fn throttle_never_drops_button_events() {
        let mut throttle = InputThrottle::new();
        let event = InputEvent::MouseInput { is_left: true, is_down: true };
        assert!(throttle.should_send(&event));
        assert!(throttle.should_send(&event));
    }
}
