//! OS input injection collaborator. Coordinates passed in are absolute
//! screen-space; the caller (input dispatch) is responsible for converting
//! from the relative wire coordinates.

use enigo::{Axis, Button, Coordinate, Direction, Enigo, Keyboard, Mouse, Settings};

use crate::error::{Error, Result};

pub trait OsInput: Send {
    fn move_mouse(&mut self, x: i32, y: i32) -> Result<()>;
    fn mouse_button(&mut self, left: bool, down: bool) -> Result<()>;
    /// Scrolls at absolute screen position `(x, y)`, positioning the
    /// pointer there first.
    fn scroll(&mut self, x: i32, y: i32, direction_vertical: bool, amount: i32) -> Result<()>;
    fn key(&mut self, keycode: u32, down: bool) -> Result<()>;
}

pub struct EnigoInput {
    enigo: Enigo,
}

impl EnigoInput {
    pub fn new() -> Result<Self> {
        let enigo = Enigo::new(&Settings::default()).map_err(|e| Error::Input(e.to_string()))?;
        Ok(EnigoInput { enigo })
    }
}

impl OsInput for EnigoInput {
    fn move_mouse(&mut self, x: i32, y: i32) -> Result<()> {
        self.enigo
            .move_mouse(x, y, Coordinate::Abs)
            .map_err(|e| Error::Input(e.to_string()))
    }

    fn mouse_button(&mut self, left: bool, down: bool) -> Result<()> {
        let button = if left { Button::Left } else { Button::Right };
        let direction = if down { Direction::Press } else { Direction::Release };
        self.enigo.button(button, direction).map_err(|e| Error::Input(e.to_string()))
    }

    fn scroll(&mut self, x: i32, y: i32, direction_vertical: bool, amount: i32) -> Result<()> {
        self.enigo.move_mouse(x, y, Coordinate::Abs).map_err(|e| Error::Input(e.to_string()))?;
        let axis = if direction_vertical { Axis::Vertical } else { Axis::Horizontal };
        self.enigo.scroll(amount, axis).map_err(|e| Error::Input(e.to_string()))
    }

    fn key(&mut self, keycode: u32, down: bool) -> Result<()> {
        let direction = if down { Direction::Press } else { Direction::Release };
        let key = enigo::Key::Unicode(char::from_u32(keycode).unwrap_or('\u{0}'));
        self.enigo.key(key, direction).map_err(|e| Error::Input(e.to_string()))
    }
}
