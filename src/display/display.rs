//! SDL2 preview window
//! Shows the LED matrix picture on a desktop, one window pixel block per LED.

use sdl2::event::Event;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use sdl2::EventPump;

use tracing::info;

use crate::capture::{Frame, FrameGeometry};
use crate::display::DisplaySink;
use crate::error::{PipelineError, Result};

/// SDL2 Window Display
/// Scales each frame up by an integer factor. Presents without vsync so a
/// frame never waits on the monitor's refresh.
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    event_pump: EventPump,
    geometry: FrameGeometry,
    rgb: Vec<u8>,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, geometry: FrameGeometry, scale: u32) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(PipelineError::display)?;

        let window = video_subsystem
            .window(
                "ledstream preview",
                geometry.width * scale,
                geometry.height * scale,
            )
            .position_centered()
            .build()
            .map_err(PipelineError::display)?;

        let canvas = window
            .into_canvas()
            .build()
            .map_err(PipelineError::display)?;
        let texture_creator = canvas.texture_creator();
        let event_pump = sdl_context.event_pump().map_err(PipelineError::display)?;

        Ok(Self {
            canvas,
            texture_creator,
            event_pump,
            geometry,
            rgb: Vec::with_capacity(geometry.width as usize * geometry.height as usize * 3),
        })
    }

    /// Expand monochrome frames so both modes share one RGB24 texture.
    fn to_rgb<'a>(&'a mut self, frame: &'a Frame) -> &'a [u8] {
        if self.geometry.color_mode.is_rgb() {
            return &frame.data;
        }
        self.rgb.clear();
        self.rgb
            .extend(frame.data.iter().flat_map(|&luma| [luma, luma, luma]));
        &self.rgb
    }

    fn present(&mut self, frame: &Frame) -> Result<()> {
        let (width, height) = (self.geometry.width, self.geometry.height);
        let rgb = self.to_rgb(frame).to_vec();

        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::RGB24, width, height)
            .map_err(PipelineError::display)?;

        let pitch = (width * 3) as usize;
        texture
            .update(None, &rgb, pitch)
            .map_err(PipelineError::display)?;

        self.canvas.clear();
        self.canvas
            .copy(&texture, None, None)
            .map_err(PipelineError::display)?;
        self.canvas.present();
        Ok(())
    }
}

impl DisplaySink for Sdl2Display {
    fn play_frame(&mut self, frame: Frame) -> Result<()> {
        for event in self.event_pump.poll_iter() {
            if let Event::Quit { .. } = event {
                info!("Quit event received");
                return Err(PipelineError::display("preview window closed"));
            }
        }
        self.present(&frame)
    }

    fn clear_screen(&mut self) -> Result<()> {
        self.canvas.clear();
        self.canvas.present();
        Ok(())
    }
}
