//! Render pipeline: decodes frame updates, reconstructs the current
//! frame, tracks observed fps, and emits `NET_FEEDBACK`.

use std::io::Read;
use std::sync::mpsc::SyncSender;
use std::time::Instant;

use crate::collaborators::ImageCodec;
use crate::error::Result;
use crate::protocol::WireMessage;
use crate::tile::FrameCache;

const FPS_WINDOW_LEN: usize = 10;

/// A fully reconstructed frame, handed off from the transport receive
/// worker (where decoding happens) to the display thread (the sole owner
/// of the on-screen surface).
pub struct FrameSnapshot {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

fn feedback_delta(fps: f64, target: f64) -> i32 {
    if target <= 0.0 {
        return 0;
    }
    if fps < 0.8 * target {
        -10
    } else if fps > 1.1 * target {
        5
    } else {
        0
    }
}

fn inflate_if_needed(body: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    if body.len() == expected_len {
        return Ok(body.to_vec());
    }
    use flate2::read::DeflateDecoder;
    let mut decoder = DeflateDecoder::new(body);
    let mut out = Vec::with_capacity(expected_len);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub struct RenderPipeline {
    codec: Box<dyn ImageCodec>,
    frame_tx: SyncSender<FrameSnapshot>,
    frame_cache: FrameCache,
    fps_window: Vec<f64>,
    last_recv: Option<Instant>,
    fps_target: f64,
}

impl RenderPipeline {
    pub fn new(codec: Box<dyn ImageCodec>, frame_tx: SyncSender<FrameSnapshot>) -> Self {
        RenderPipeline {
            codec,
            frame_tx,
            frame_cache: FrameCache::new(),
            fps_window: Vec::new(),
            last_recv: None,
            fps_target: 120.0,
        }
    }

    /// Handles one decoded payload, handing a reconstructed frame to the
    /// display thread when applicable. Returns the `NET_FEEDBACK` bytes to
    /// send back to the peer, or `None` for messages that don't carry
    /// frame-update semantics on this role.
    pub fn handle(&mut self, message: WireMessage) -> Result<Option<Vec<u8>>> {
        match message {
            WireMessage::NoChange => {
                self.record_tick();
                Ok(Some(self.feedback_payload()))
            }
            WireMessage::NumpyUpdate { height, width, channels, body } => {
                let expected = height as usize * width as usize * channels as usize;
                let rgb = inflate_if_needed(&body, expected)?;
                self.frame_cache.replace_whole(width, height, rgb);
                self.emit_snapshot();
                self.record_tick();
                Ok(Some(self.feedback_payload()))
            }
            WireMessage::TilesUpdate { quality: _, fps_target, tiles } => {
                self.fps_target = fps_target as f64;
                for tile in tiles {
                    let (_, _, rgb) = self.codec.decode(&tile.body)?;
                    self.frame_cache.apply_tile(tile.header.x, tile.header.y, tile.header.w, tile.header.h, rgb);
                }
                self.emit_snapshot();
                self.record_tick();
                Ok(Some(self.feedback_payload()))
            }
            WireMessage::DeltaUpdate { x1, y1, x2, y2, body } => {
                let (_, _, rgb) = self.codec.decode(&body)?;
                self.frame_cache.apply_tile(x1, y1, x2 - x1, y2 - y1, rgb);
                self.emit_snapshot();
                self.record_tick();
                Ok(Some(self.feedback_payload()))
            }
            other => {
                log::warn!("unexpected message on render pipeline: {:?}", other);
                Ok(None)
            }
        }
    }

    fn emit_snapshot(&self) {
        let (width, height) = self.frame_cache.extent();
        if width == 0 || height == 0 {
            return;
        }
        let snapshot = FrameSnapshot { width, height, rgb: self.frame_cache.reconstruct() };
        if self.frame_tx.try_send(snapshot).is_err() {
            log::trace!("display thread behind; dropping a reconstructed frame");
        }
    }

    fn record_tick(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_recv {
            let elapsed = now.duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                self.fps_window.push(1.0 / elapsed);
                if self.fps_window.len() > FPS_WINDOW_LEN {
                    self.fps_window.remove(0);
                }
            }
        }
        self.last_recv = Some(now);
    }

    fn instantaneous_fps(&self) -> f64 {
        self.fps_window.last().copied().unwrap_or(0.0)
    }

    fn feedback_payload(&self) -> Vec<u8> {
        let fps = self.instantaneous_fps();
        WireMessage::encode_net_feedback(feedback_delta(fps, self.fps_target), fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_law_thresholds() {
        assert_eq!(feedback_delta(40.0, 120.0), -10);
        assert_eq!(feedback_delta(140.0, 120.0), 5);
        assert_eq!(feedback_delta(115.0, 120.0), 0);
    }

    #[test]
    fn no_target_yields_no_feedback() {
        assert_eq!(feedback_delta(60.0, 0.0), 0);
    }

    #[test]
    fn raw_body_passes_through_without_inflation() {
        let body = vec![1, 2, 3, 4];
        assert_eq!(inflate_if_needed(&body, 4).unwrap(), body);
    }
}
