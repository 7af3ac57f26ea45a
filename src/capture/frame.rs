use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// One decoded, pre-scaled video frame.
///
/// `data` is immutable once constructed; cloning shares the allocation.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Bytes,

    /// Zero-based position of this frame in the session's stream
    pub index: usize,

    /// When the frame came off the fifo, for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, index: usize) -> Self {
        Self {
            data,
            index,
            timestamp: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Color modes a video can be rendered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    #[default]
    Color,
    Bw,
    Red,
    Green,
    Blue,
    InvColor,
    InvBw,
}

impl ColorMode {
    /// Whether frames carry three bytes per pixel instead of one.
    pub fn is_rgb(self) -> bool {
        matches!(self, Self::Color | Self::InvColor)
    }

    pub fn bytes_per_pixel(self) -> usize {
        if self.is_rgb() {
            3
        } else {
            1
        }
    }

    /// Raw pixel format the transcoder should emit
    pub fn ffmpeg_pix_fmt(self) -> &'static str {
        if self.is_rgb() {
            "rgb24"
        } else {
            "gray"
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::Bw => "bw",
            Self::Red => "red",
            Self::Green => "green",
            Self::Blue => "blue",
            Self::InvColor => "inv_color",
            Self::InvBw => "inv_bw",
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "color" => Ok(Self::Color),
            "bw" => Ok(Self::Bw),
            "red" => Ok(Self::Red),
            "green" => Ok(Self::Green),
            "blue" => Ok(Self::Blue),
            "inv_color" => Ok(Self::InvColor),
            "inv_bw" => Ok(Self::InvBw),
            other => Err(format!("unknown color mode: {other}")),
        }
    }
}

/// Frame dimensions negotiated for one playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub color_mode: ColorMode,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, color_mode: ColorMode) -> Self {
        Self {
            width,
            height,
            color_mode,
        }
    }

    /// Exact number of bytes the transcoder writes per frame.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.color_mode.bytes_per_pixel()
    }
}
