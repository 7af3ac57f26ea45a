pub mod housekeeping;
pub mod ringbuf;
pub mod scheduler;
pub mod session;
pub mod supervisor;

pub use housekeeping::Housekeeper;
pub use ringbuf::FrameBuffer;
pub use scheduler::{Clock, LoopSettings, ManualClock, PlaybackClock, PlaybackLoop, SystemClock, Tick};
pub use session::{probe_fps, VideoSession};
pub use supervisor::{AttemptRunner, CommandRemediation, Remediation, RetryPolicy};
