//! Trait boundaries for everything the streaming engine treats as an
//! external collaborator, plus one default concrete implementation each.
//! The engine (transport, config, tile cache, capture/render pipelines)
//! never names a concrete type from this module directly outside of
//! construction in the session wiring.

mod capture_backend;
mod codec;
mod display;
mod os_input;

pub use capture_backend::{ScrapCapture, ScreenCapture};
pub use codec::{ImageCodec, JpegCodec};
pub use display::{DisplaySurface, SdlDisplay};
pub use os_input::{EnigoInput, OsInput};
