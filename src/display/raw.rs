//! Raw frame sinks for external LED drivers

use std::io::Write;

use tracing::{debug, instrument};

use crate::capture::{Frame, FrameGeometry};
use crate::display::DisplaySink;
use crate::error::Result;

/// Writes every frame verbatim to `out`, e.g. a pipe read by a matrix
/// driver process. Clearing the screen writes one all-black frame.
pub struct RawSink<W: Write> {
    out: W,
    frame_size: usize,
}

impl<W: Write> RawSink<W> {
    pub fn new(out: W, geometry: FrameGeometry) -> Self {
        Self {
            out,
            frame_size: geometry.frame_size(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> DisplaySink for RawSink<W> {
    #[instrument(level = "trace", skip_all, fields(index = frame.index))]
    fn play_frame(&mut self, frame: Frame) -> Result<()> {
        self.out.write_all(&frame.data)?;
        self.out.flush()?;
        Ok(())
    }

    fn clear_screen(&mut self) -> Result<()> {
        debug!("Clearing screen");
        self.out.write_all(&vec![0u8; self.frame_size])?;
        self.out.flush()?;
        Ok(())
    }
}

/// Discards frames. Useful for measuring pipeline throughput.
#[derive(Debug, Default)]
pub struct NullSink {
    pub frames: u64,
}

impl DisplaySink for NullSink {
    fn play_frame(&mut self, _frame: Frame) -> Result<()> {
        self.frames += 1;
        Ok(())
    }

    fn clear_screen(&mut self) -> Result<()> {
        Ok(())
    }
}
