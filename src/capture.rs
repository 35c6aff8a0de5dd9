//! Capture pipeline: the controllee's pacing loop, change detection,
//! adaptive quality selection, and the three wire encodings it can emit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::collaborators::{ImageCodec, ScreenCapture};
use crate::config::{self, Configuration};
use crate::error::Result;
use crate::protocol::{EncodedTile, TileHeader, WireMessage};
use crate::tile::{self, FrameView, Tile, TileCache};
use crate::transport::Transport;

const PACING_TICK: Duration = Duration::from_millis(1);
const DELTA_AREA_THRESHOLD: u32 = 50_000;

/// Quality offset and tile size, both mutated by `NET_FEEDBACK` messages
/// arriving on the transport receive worker and read by the capture
/// worker on its own thread.
pub struct AdaptiveState {
    quality_offset: i32,
    tile_size: u32,
    fps_window: Vec<f64>,
}

impl AdaptiveState {
    pub fn new() -> Self {
        AdaptiveState { quality_offset: 0, tile_size: tile::INITIAL_TILE_SIZE, fps_window: Vec::new() }
    }

    /// Applies one `NET_FEEDBACK` observation: folds `delta` into the
    /// clamped quality offset and pushes `fps` into a length-10 rolling
    /// window used to adapt tile size.
    pub fn apply_feedback(&mut self, delta: i32, fps: f64) {
        self.quality_offset = (self.quality_offset + delta).clamp(-50, 50);

        self.fps_window.push(fps);
        if self.fps_window.len() > 10 {
            self.fps_window.remove(0);
        }
        let avg = self.fps_window.iter().sum::<f64>() / self.fps_window.len() as f64;
        self.tile_size = tile::adapt_tile_size(self.tile_size, avg);
    }
}

impl Default for AdaptiveState {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes quality from an fps-tier base, adjusted by how much of the
/// frame changed, then nudged by the accumulated feedback offset and
/// clamped to a sane range.
fn compute_quality(fps_target: f64, change_ratio: f64, feedback_offset: i32) -> u32 {
    let base: i32 = if fps_target >= 120.0 {
        20
    } else if fps_target >= 60.0 {
        35
    } else {
        60
    };
    let adjusted = if change_ratio < 0.05 {
        (base + 30).min(95)
    } else if change_ratio < 0.2 {
        base
    } else {
        (base - 15).max(10)
    };
    (adjusted + feedback_offset).clamp(10, 95) as u32
}

fn bgra_to_rgb(bgra: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(bgra.len() / 4 * 3);
    for pixel in bgra.chunks_exact(4) {
        rgb.push(pixel[2]);
        rgb.push(pixel[1]);
        rgb.push(pixel[0]);
    }
    rgb
}

/// Integer-step decimation along both axes; an explicit escape hatch for
/// the raw-pixel fast path only (tiled mode uses a real resampler).
fn decimate(rgb: &[u8], width: u32, height: u32, step: u32) -> (u32, u32, Vec<u8>) {
    if step <= 1 {
        return (width, height, rgb.to_vec());
    }
    let new_width = (width + step - 1) / step;
    let new_height = (height + step - 1) / step;
    let mut out = Vec::with_capacity(new_width as usize * new_height as usize * 3);
    let mut y = 0;
    while y < height {
        let mut x = 0;
        while x < width {
            let idx = (y as usize * width as usize + x as usize) * 3;
            out.extend_from_slice(&rgb[idx..idx + 3]);
            x += step;
        }
        y += step;
    }
    (new_width, new_height, out)
}

/// Rescales an RGB8 buffer with the `image` crate's Lanczos3 filter.
fn resample(rgb: &[u8], width: u32, height: u32, scale: f64) -> (u32, u32, Vec<u8>) {
    if (scale - 1.0).abs() < f64::EPSILON {
        return (width, height, rgb.to_vec());
    }
    let new_width = ((width as f64) * scale).round().max(1.0) as u32;
    let new_height = ((height as f64) * scale).round().max(1.0) as u32;
    let buffer = image::RgbImage::from_raw(width, height, rgb.to_vec())
        .expect("capture buffer always matches its own declared extent");
    let resized = image::imageops::resize(&buffer, new_width, new_height, image::imageops::FilterType::Lanczos3);
    (new_width, new_height, resized.into_raw())
}

pub struct CaptureWorker {
    config: Configuration,
    transport: Arc<Transport>,
    capture: Arc<Mutex<Box<dyn ScreenCapture>>>,
    codec: Box<dyn ImageCodec>,
    adaptive: Arc<Mutex<AdaptiveState>>,
    tile_cache: TileCache,
    previous_frame: Option<(u32, u32, Vec<u8>)>,
    in_progress: Arc<AtomicBool>,
}

impl CaptureWorker {
    pub fn new(
        config: Configuration,
        transport: Arc<Transport>,
        capture: Arc<Mutex<Box<dyn ScreenCapture>>>,
        codec: Box<dyn ImageCodec>,
        adaptive: Arc<Mutex<AdaptiveState>>,
    ) -> Self {
        CaptureWorker {
            config,
            transport,
            capture,
            codec,
            adaptive,
            tile_cache: TileCache::new(),
            previous_frame: None,
            in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs the pacing loop until `running` is cleared. One capture per
    /// tick, never overlapping: `in_progress` is the mutual-exclusion
    /// guard the testable property requires.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        let mut last_capture = Instant::now() - self.config.capture_interval();
        while running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now.duration_since(last_capture) >= self.config.capture_interval()
                && self.in_progress.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
            {
                last_capture = now;
                if let Err(error) = self.capture_encode_send() {
                    log::warn!("capture tick failed: {}", error);
                }
                self.in_progress.store(false, Ordering::SeqCst);
            }
            thread::sleep(PACING_TICK);
        }
    }

    fn capture_encode_send(&mut self) -> Result<()> {
        let use_numpy = self.config.get_bool(config::KEY_USE_NUMPY, config::DEFAULT_USE_NUMPY);
        let scale = self.config.get_f64(config::KEY_SCALE, config::DEFAULT_SCALE);
        let fps = self.config.get_f64(config::KEY_FPS, config::DEFAULT_FPS as f64);
        let monitor_index = self.clamped_monitor();

        if use_numpy && scale <= 0.5 && fps >= 90.0 {
            return self.send_numpy(monitor_index, scale, fps);
        }

        // One grab per tick, shared by the delta check and the tile
        // fallback so both see the same live content.
        let (width, height, rgb) = self.capture_rgb(monitor_index, scale)?;

        let delta_payload = if !use_numpy { self.try_delta(width, height, &rgb, fps)? } else { None };
        let result = match delta_payload {
            Some(payload) => self.transport.send(payload),
            None => self.send_tiles(width, height, &rgb, fps),
        };
        self.previous_frame = Some((width, height, rgb));
        result
    }

    fn clamped_monitor(&self) -> usize {
        let requested = self.config.get_i64(config::KEY_MONITOR, config::DEFAULT_MONITOR).max(0) as usize;
        let count = self.capture.lock().unwrap().monitor_count();
        requested.min(count.saturating_sub(1))
    }

    fn capture_rgb(&mut self, monitor_index: usize, scale: f64) -> Result<(u32, u32, Vec<u8>)> {
        let (width, height, bgra) = self.capture.lock().unwrap().grab(monitor_index)?;
        let rgb = bgra_to_rgb(&bgra);
        Ok(resample(&rgb, width, height, scale))
    }

    fn send_numpy(&mut self, monitor_index: usize, scale: f64, fps: f64) -> Result<()> {
        let (width, height, bgra) = self.capture.lock().unwrap().grab(monitor_index)?;
        let rgb = bgra_to_rgb(&bgra);
        let step = (1.0 / scale).floor().max(1.0) as u32;
        let (decimated_width, decimated_height, decimated) = decimate(&rgb, width, height, step);

        let compression_level = self.config.get_i64(config::KEY_COMPRESSION_LEVEL, config::DEFAULT_COMPRESSION_LEVEL);
        let body = if fps > 120.0 {
            decimated
        } else {
            use flate2::write::DeflateEncoder;
            use flate2::Compression;
            use std::io::Write;
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(compression_level as u32));
            encoder.write_all(&decimated)?;
            encoder.finish()?
        };

        let payload = WireMessage::encode_numpy(decimated_height, decimated_width, 3, &body);
        self.transport.send(payload)?;
        Ok(())
    }

    fn try_delta(&mut self, width: u32, height: u32, rgb: &[u8], fps: f64) -> Result<Option<Vec<u8>>> {
        let bbox = match &self.previous_frame {
            Some((pw, ph, previous)) if *pw == width && *ph == height => diff_bbox(previous, rgb, width, height),
            _ => None,
        };

        let Some((x1, y1, x2, y2)) = bbox else {
            return Ok(None);
        };
        let area = (x2 - x1) * (y2 - y1);
        if area == 0 || area >= DELTA_AREA_THRESHOLD {
            return Ok(None);
        }

        let patch_width = x2 - x1;
        let patch_height = y2 - y1;
        let mut patch = Vec::with_capacity(patch_width as usize * patch_height as usize * 3);
        for row in y1..y2 {
            let start = (row as usize * width as usize + x1 as usize) * 3;
            let end = start + patch_width as usize * 3;
            patch.extend_from_slice(&rgb[start..end]);
        }

        let quality = self.current_quality(fps, 0.0);
        let body = self.codec.encode(&patch, patch_width, patch_height, quality as u8)?;
        Ok(Some(WireMessage::encode_delta(x1, y1, x2, y2, &body)))
    }

    fn send_tiles(&mut self, width: u32, height: u32, rgb: &[u8], fps: f64) -> Result<()> {
        let tile_size = self.adaptive.lock().unwrap().tile_size;
        let view = FrameView { width, height, stride: width as usize * 3, bytes_per_pixel: 3, pixels: rgb };
        let changed = self.tile_cache.changed_tiles(&view, tile_size, Instant::now());

        if changed.is_empty() {
            self.transport.send(WireMessage::encode_no_change())?;
            return Ok(());
        }

        let total_tiles = ((width + tile_size - 1) / tile_size) * ((height + tile_size - 1) / tile_size);
        let change_ratio = changed.len() as f64 / total_tiles.max(1) as f64;
        let quality = self.current_quality(fps, change_ratio);

        let mut encoded = Vec::with_capacity(changed.len());
        for tile in &changed {
            let body = self.codec.encode(&tile_rgb(rgb, width, *tile), tile.w, tile.h, quality as u8)?;
            encoded.push(EncodedTile {
                header: TileHeader { x: tile.x, y: tile.y, w: tile.w, h: tile.h, body_len: body.len() as u32 },
                body,
            });
        }

        let payload = WireMessage::encode_tiles(quality, fps as u32, &encoded);
        self.transport.send(payload)?;
        Ok(())
    }

    fn current_quality(&self, fps_target: f64, change_ratio: f64) -> u32 {
        let offset = self.adaptive.lock().unwrap().quality_offset;
        compute_quality(fps_target, change_ratio, offset)
    }
}

fn tile_rgb(frame_rgb: &[u8], frame_width: u32, tile: Tile) -> Vec<u8> {
    let mut out = Vec::with_capacity(tile.w as usize * tile.h as usize * 3);
    for row in tile.y..tile.y + tile.h {
        let start = (row as usize * frame_width as usize + tile.x as usize) * 3;
        let end = start + tile.w as usize * 3;
        out.extend_from_slice(&frame_rgb[start..end]);
    }
    out
}

/// Bounding box of every pixel that differs between two equal-sized RGB8
/// frames, or `None` if they are byte-identical.
fn diff_bbox(previous: &[u8], current: &[u8], width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
    let (mut max_x, mut max_y) = (0u32, 0u32);
    let mut found = false;

    for y in 0..height {
        let row_start = y as usize * width as usize * 3;
        let row = &current[row_start..row_start + width as usize * 3];
        let previous_row = &previous[row_start..row_start + width as usize * 3];
        if row == previous_row {
            continue;
        }
        for x in 0..width {
            let idx = x as usize * 3;
            if row[idx..idx + 3] != previous_row[idx..idx + 3] {
                found = true;
                min_x = min_x.min(x);
                max_x = max_x.max(x + 1);
                min_y = min_y.min(y);
                max_y = max_y.max(y + 1);
            }
        }
    }

    if found {
        Some((min_x, min_y, max_x, max_y))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_floor_and_ceiling() {
        assert_eq!(compute_quality(120.0, 0.3, 0), 10);
        assert_eq!(compute_quality(30.0, 0.01, 0), 90);
        assert_eq!(compute_quality(30.0, 0.01, 50), 95);
        assert_eq!(compute_quality(120.0, 0.3, -50), 10);
    }

    #[test]
    fn feedback_accumulates_and_clamps() {
        let mut state = AdaptiveState::new();
        for _ in 0..10 {
            state.apply_feedback(-10, 40.0);
        }
        assert_eq!(state.quality_offset, -50);
    }

    #[test]
    fn identical_frames_have_no_diff_bbox() {
        let frame = vec![7u8; 8 * 8 * 3];
        assert!(diff_bbox(&frame, &frame, 8, 8).is_none());
    }

    #[test]
    fn single_pixel_change_has_a_tight_bbox() {
        let previous = vec![0u8; 8 * 8 * 3];
        let mut current = previous.clone();
        let idx = (3 * 8 + 4) * 3;
        current[idx] = 255;
        let bbox = diff_bbox(&previous, &current, 8, 8).unwrap();
        assert_eq!(bbox, (4, 3, 5, 4));
    }

    #[test]
    fn bgra_reorders_to_rgb() {
        let bgra = vec![10, 20, 30, 255];
        assert_eq!(bgra_to_rgb(&bgra), vec![30, 20, 10]);
    }

    #[test]
    fn decimation_halves_dimensions_at_step_two() {
        let rgb = vec![1u8; 4 * 4 * 3];
        let (w, h, out) = decimate(&rgb, 4, 4, 2);
        assert_eq!((w, h), (2, 2));
        assert_eq!(out.len(), 2 * 2 * 3);
    }
}
