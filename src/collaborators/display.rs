//! Display surface collaborator: the controller's on-screen window. Owned
//! exclusively by the display thread, matching the concurrency model.

use sdl2::event::Event;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, Texture, TextureCreator};
use sdl2::video::{Window, WindowContext};
use sdl2::EventPump;

use crate::error::{Error, Result};

pub trait DisplaySurface {
    fn set_frame(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<()>;
    fn size(&self) -> (u32, u32);
}

pub struct SdlDisplay {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    event_pump: EventPump,
    extent: (u32, u32),
}

impl SdlDisplay {
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self> {
        let sdl_context = sdl2::init().map_err(Error::Display)?;
        let video = sdl_context.video().map_err(Error::Display)?;
        let window = video
            .window(title, width, height)
            .resizable()
            .build()
            .map_err(|e| Error::Display(e.to_string()))?;
        let canvas = window.into_canvas().build().map_err(|e| Error::Display(e.to_string()))?;
        let texture_creator = canvas.texture_creator();
        let event_pump = sdl_context.event_pump().map_err(Error::Display)?;
        Ok(SdlDisplay { canvas, texture_creator, event_pump, extent: (width, height) })
    }

    /// Drains pending window/input events without blocking.
    pub fn poll_events(&mut self) -> Vec<Event> {
        self.event_pump.poll_iter().collect()
    }
}

impl DisplaySurface for SdlDisplay {
    fn set_frame(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<()> {
        let mut texture: Texture<'_> = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::RGB24, width, height)
            .map_err(|e| Error::Display(e.to_string()))?;
        let stride = width as usize * 3;
        texture.update(None, rgb, stride).map_err(|e| Error::Display(e.to_string()))?;
        self.canvas.clear();
        self.canvas.copy(&texture, None, None).map_err(|e| Error::Display(e.to_string()))?;
        self.canvas.present();
        self.extent = (width, height);
        Ok(())
    }

    /// The window's current drawable size, used to convert pointer
    /// positions to coordinates relative to the displayed frame.
    fn size(&self) -> (u32, u32) {
        self.canvas.output_size().unwrap_or(self.extent)
    }
}
