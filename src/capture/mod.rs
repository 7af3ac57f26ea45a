pub mod fps;
pub mod frame;
pub mod ingest;
pub mod process;
pub mod source;

pub use fps::{FpsProbe, ResolvedFps};
pub use frame::{ColorMode, Frame, FrameGeometry};
pub use ingest::{FifoReader, FrameIngestor, FrameSource, Ingest};
pub use process::{PipelineBuilder, PipelineProcess};
pub use source::VideoSource;
