//! Tile geometry, content fingerprinting, and the change-detection caches
//! kept on both sides of a connection.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

pub const INITIAL_TILE_SIZE: u32 = 64;
pub const MIN_TILE_SIZE: u32 = 32;
pub const MAX_TILE_SIZE: u32 = 128;
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// A rectangular, axis-aligned region of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// A borrowed view over a captured frame's raw pixel bytes, used only to
/// compute per-tile fingerprints without copying the whole frame.
pub struct FrameView<'a> {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub bytes_per_pixel: usize,
    pub pixels: &'a [u8],
}

impl<'a> FrameView<'a> {
    fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.pixels[start..start + self.stride]
    }

    fn fingerprint(&self, tile: Tile) -> u64 {
        let mut hasher = DefaultHasher::new();
        let row_bytes = tile.w as usize * self.bytes_per_pixel;
        for y in tile.y..tile.y + tile.h {
            let row = self.row(y);
            let start = tile.x as usize * self.bytes_per_pixel;
            row[start..start + row_bytes].hash(&mut hasher);
        }
        hasher.finish()
    }

    fn tiles(&self, tile_size: u32) -> impl Iterator<Item = Tile> + '_ {
        let width = self.width;
        let height = self.height;
        (0..height).step_by(tile_size as usize).flat_map(move |y| {
            let h = tile_size.min(height - y);
            (0..width).step_by(tile_size as usize).map(move |x| {
                let w = tile_size.min(width - x);
                Tile { x, y, w, h }
            })
        })
    }
}

struct CacheEntry {
    fingerprint: u64,
    last_sent: Instant,
}

/// Controllee-side cache: grid coordinate -> last transmitted fingerprint
/// and the time it was last sent. A tile is retransmitted when its
/// fingerprint changes, or unconditionally after `RESYNC_INTERVAL`.
pub struct TileCache {
    entries: HashMap<(u32, u32), CacheEntry>,
}

impl TileCache {
    pub fn new() -> Self {
        TileCache { entries: HashMap::new() }
    }

    /// Returns every tile that must be (re)transmitted this round, and
    /// records it as sent. An empty result means `NO_CHANGE`.
    pub fn changed_tiles(&mut self, frame: &FrameView, tile_size: u32, now: Instant) -> Vec<Tile> {
        let mut changed = Vec::new();
        for tile in frame.tiles(tile_size) {
            let key = (tile.x / tile_size, tile.y / tile_size);
            let fingerprint = frame.fingerprint(tile);
            let needs_send = match self.entries.get(&key) {
                Some(entry) => {
                    entry.fingerprint != fingerprint || now.duration_since(entry.last_sent) >= RESYNC_INTERVAL
                }
                None => true,
            };
            if needs_send {
                self.entries.insert(key, CacheEntry { fingerprint, last_sent: now });
                changed.push(tile);
            }
        }
        changed
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded tile as held by the controller-side frame reconstruction.
struct DecodedBlock {
    w: u32,
    h: u32,
    rgb: Vec<u8>,
}

/// Controller-side cache: pixel origin -> decoded block. `reconstruct`
/// paints every cached block onto a black canvas sized to the current
/// extent, satisfying the invariant that the canvas always reflects the
/// most recently applied tile at each origin.
pub struct FrameCache {
    blocks: HashMap<(u32, u32), DecodedBlock>,
    extent: (u32, u32),
}

impl FrameCache {
    pub fn new() -> Self {
        FrameCache { blocks: HashMap::new(), extent: (0, 0) }
    }

    pub fn apply_tile(&mut self, x: u32, y: u32, w: u32, h: u32, rgb: Vec<u8>) {
        self.extent.0 = self.extent.0.max(x + w);
        self.extent.1 = self.extent.1.max(y + h);
        self.blocks.insert((x, y), DecodedBlock { w, h, rgb });
    }

    /// Replaces the entire frame with a single raw-pixel buffer, as used
    /// by the `NUMPY` fast path which has no tile grid of its own.
    pub fn replace_whole(&mut self, width: u32, height: u32, rgb: Vec<u8>) {
        self.blocks.clear();
        self.extent = (width, height);
        self.blocks.insert((0, 0), DecodedBlock { w: width, h: height, rgb });
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    /// Renders the current frame as an RGB8 canvas, 3 bytes per pixel.
    pub fn reconstruct(&self) -> Vec<u8> {
        let (width, height) = self.extent;
        let mut canvas = vec![0u8; width as usize * height as usize * 3];
        let stride = width as usize * 3;
        for (&(x, y), block) in &self.blocks {
            for row in 0..block.h {
                let canvas_start = (y + row) as usize * stride + x as usize * 3;
                let block_start = row as usize * block.w as usize * 3;
                let len = block.w as usize * 3;
                canvas[canvas_start..canvas_start + len]
                    .copy_from_slice(&block.rgb[block_start..block_start + len]);
            }
        }
        canvas
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Adjusts tile size from a rolling-window average observed fps.
pub fn adapt_tile_size(current: u32, avg_fps: f64) -> u32 {
    if avg_fps < 30.0 {
        (current / 2).max(MIN_TILE_SIZE)
    } else if avg_fps > 50.0 {
        (current * 2).min(MAX_TILE_SIZE)
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, value: u8) -> Vec<u8> {
        vec![value; width as usize * height as usize * 3]
    }

    #[test]
    fn first_pass_sends_every_tile() {
        let pixels = solid_frame(128, 128, 10);
        let view = FrameView { width: 128, height: 128, stride: 128 * 3, bytes_per_pixel: 3, pixels: &pixels };
        let mut cache = TileCache::new();
        let changed = cache.changed_tiles(&view, 64, Instant::now());
        assert_eq!(changed.len(), 4);
    }

    #[test]
    fn unchanged_frame_yields_no_tiles_until_resync() {
        let pixels = solid_frame(64, 64, 10);
        let view = FrameView { width: 64, height: 64, stride: 64 * 3, bytes_per_pixel: 3, pixels: &pixels };
        let mut cache = TileCache::new();
        let now = Instant::now();
        let first = cache.changed_tiles(&view, 64, now);
        assert_eq!(first.len(), 1);
        let second = cache.changed_tiles(&view, 64, now);
        assert!(second.is_empty());
    }

    #[test]
    fn changed_pixels_trigger_retransmission() {
        let mut pixels = solid_frame(64, 64, 10);
        let view = FrameView { width: 64, height: 64, stride: 64 * 3, bytes_per_pixel: 3, pixels: &pixels };
        let mut cache = TileCache::new();
        let now = Instant::now();
        cache.changed_tiles(&view, 64, now);
        pixels[0] = 200;
        let view = FrameView { width: 64, height: 64, stride: 64 * 3, bytes_per_pixel: 3, pixels: &pixels };
        let changed = cache.changed_tiles(&view, 64, now);
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn frame_cache_reconstructs_from_tiles() {
        let mut cache = FrameCache::new();
        cache.apply_tile(0, 0, 2, 2, vec![255, 0, 0, 255, 0, 0, 255, 0, 0, 255, 0, 0]);
        cache.apply_tile(2, 0, 2, 2, vec![0, 255, 0, 0, 255, 0, 0, 255, 0, 0, 255, 0]);
        assert_eq!(cache.extent(), (4, 2));
        let canvas = cache.reconstruct();
        assert_eq!(canvas.len(), 4 * 2 * 3);
        assert_eq!(&canvas[0..3], &[255, 0, 0]);
        assert_eq!(&canvas[6..9], &[0, 255, 0]);
    }

    #[test]
    fn tile_size_adapts_to_rolling_fps() {
        assert_eq!(adapt_tile_size(64, 20.0), 32);
        assert_eq!(adapt_tile_size(64, 60.0), 128);
        assert_eq!(adapt_tile_size(64, 40.0), 64);
        assert_eq!(adapt_tile_size(MIN_TILE_SIZE, 10.0), MIN_TILE_SIZE);
        assert_eq!(adapt_tile_size(MAX_TILE_SIZE, 90.0), MAX_TILE_SIZE);
    }
}
