//! Screen capture collaborator.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Upper bound on how long `grab` will retry a `WouldBlock` backend before
/// giving up. Bounds the capture worker's per-tick block time so a stalled
/// backend cannot hang the worker thread's join past a shutdown request.
const GRAB_TIMEOUT: Duration = Duration::from_secs(2);

/// A captured frame's raw pixel bytes, in BGRA order, row-major, tightly
/// packed (stride == width * 4).
pub trait ScreenCapture: Send {
    fn monitor_count(&self) -> usize;
    fn monitor_extent(&self, index: usize) -> Result<(u32, u32)>;
    fn grab(&mut self, index: usize) -> Result<(u32, u32, Vec<u8>)>;
}

/// `scrap`-backed capturer. Recreated per monitor index since `scrap`
/// binds a `Capturer` to a single `Display` at construction time.
pub struct ScrapCapture {
    displays: Vec<scrap::Display>,
    capturer: Option<(usize, scrap::Capturer)>,
}

impl ScrapCapture {
    pub fn new() -> Result<Self> {
        let displays = scrap::Display::all().map_err(|e| Error::Capture(e.to_string()))?;
        Ok(ScrapCapture { displays, capturer: None })
    }

    fn capturer_for(&mut self, index: usize) -> Result<&mut scrap::Capturer> {
        let needs_new = match &self.capturer {
            Some((current, _)) => *current != index,
            None => true,
        };
        if needs_new {
            let display = scrap::Display::all()
                .map_err(|e| Error::Capture(e.to_string()))?
                .into_iter()
                .nth(index)
                .ok_or_else(|| Error::Capture(format!("no monitor at index {}", index)))?;
            let capturer = scrap::Capturer::new(display).map_err(|e| Error::Capture(e.to_string()))?;
            self.capturer = Some((index, capturer));
        }
        Ok(&mut self.capturer.as_mut().unwrap().1)
    }
}

// SAFETY: `scrap`'s X11 backend holds raw Xlib pointers that aren't
// auto-Send, but `ScrapCapture` is only ever accessed through an
// `Arc<Mutex<..>>` (see `session.rs`/`capture.rs`), so at most one thread
// touches it at a time and it is never accessed concurrently.
unsafe impl Send for ScrapCapture {}

impl ScreenCapture for ScrapCapture {
    fn monitor_count(&self) -> usize {
        self.displays.len()
    }

    fn monitor_extent(&self, index: usize) -> Result<(u32, u32)> {
        let display = self
            .displays
            .get(index)
            .ok_or_else(|| Error::Capture(format!("no monitor at index {}", index)))?;
        Ok((display.width() as u32, display.height() as u32))
    }

    fn grab(&mut self, index: usize) -> Result<(u32, u32, Vec<u8>)> {
        let (width, height) = self.monitor_extent(index)?;
        let capturer = self.capturer_for(index)?;
        let deadline = Instant::now() + GRAB_TIMEOUT;
        loop {
            match capturer.frame() {
                Ok(frame) => {
                    let stride = frame.len() / height as usize;
                    if stride == width as usize * 4 {
                        return Ok((width, height, frame.to_vec()));
                    }
                    // Some backends pad each row to a platform-specific
                    // stride; strip the padding so downstream code can
                    // assume stride == width * 4.
                    let mut packed = Vec::with_capacity(width as usize * height as usize * 4);
                    for row in frame.chunks(stride) {
                        packed.extend_from_slice(&row[..width as usize * 4]);
                    }
                    return Ok((width, height, packed));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Capture("timed out waiting for a frame".into()));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                Err(e) => return Err(Error::Capture(e.to_string())),
            }
        }
    }
}
