pub mod raw;

#[cfg(feature = "sdl-preview")]
pub mod display;

pub use raw::{NullSink, RawSink};

#[cfg(feature = "sdl-preview")]
pub use display::Sdl2Display;

use crate::capture::Frame;
use crate::error::Result;

/// Where displayed frames go.
///
/// `play_frame` must return promptly: any internal queueing would push the
/// picture out of sync with the wall clock (and the audio).
pub trait DisplaySink {
    fn play_frame(&mut self, frame: Frame) -> Result<()>;

    fn clear_screen(&mut self) -> Result<()>;
}

impl<D: DisplaySink + ?Sized> DisplaySink for &mut D {
    fn play_frame(&mut self, frame: Frame) -> Result<()> {
        (**self).play_frame(frame)
    }

    fn clear_screen(&mut self) -> Result<()> {
        (**self).clear_screen()
    }
}

impl<D: DisplaySink + ?Sized> DisplaySink for Box<D> {
    fn play_frame(&mut self, frame: Frame) -> Result<()> {
        (**self).play_frame(frame)
    }

    fn clear_screen(&mut self) -> Result<()> {
        (**self).clear_screen()
    }
}
