//! Non-blocking frame ingestion from the transcoder's fifo

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Result of one ingestion attempt
#[derive(Debug)]
pub enum Ingest {
    /// No complete frame is available yet
    Pending,
    /// One whole frame's bytes
    Frame(Bytes),
    /// The producer is done; nothing more will arrive
    EndOfStream,
}

/// Producer side of the playback loop. Implementations must never block.
pub trait FrameSource {
    fn poll_frame(&mut self) -> Result<Ingest>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn poll_frame(&mut self) -> Result<Ingest> {
        (**self).poll_frame()
    }
}

/// Reads fixed-size frame records from the read end of a fifo.
///
/// The fifo is opened non-blocking, so a frame may arrive over several
/// polls; bytes are accumulated until a full frame is present. Hitting EOF
/// with a partial frame pending is a protocol violation.
pub struct FifoReader {
    file: File,
    frame_size: usize,
    pending: BytesMut,
    eof: bool,
}

impl FifoReader {
    /// Open the read end without waiting for a writer.
    pub fn open(path: &Path, frame_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        debug!("Opened frame fifo {} for reading", path.display());
        Ok(Self::from_file(file, frame_size))
    }

    pub fn from_file(file: File, frame_size: usize) -> Self {
        Self {
            file,
            frame_size,
            pending: BytesMut::with_capacity(frame_size),
            eof: false,
        }
    }

    /// Open the write end for the transcoder. Must come after [`open`],
    /// otherwise opening a fifo for writing blocks.
    ///
    /// [`open`]: FifoReader::open
    pub fn open_writer(path: &Path) -> Result<File> {
        Ok(OpenOptions::new().write(true).open(path)?)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn is_readable(&self) -> Result<bool> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::ZERO)?;
        if ready == 0 {
            return Ok(false);
        }
        // A writer hanging up reads as EOF, so it counts as readable
        Ok(fds[0]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)))
    }

    fn finish_eof(&mut self) -> Result<Ingest> {
        self.eof = true;
        if self.pending.is_empty() {
            info!("No transcoder output, end of video processing");
            Ok(Ingest::EndOfStream)
        } else {
            Err(PipelineError::ShortFrame {
                expected: self.frame_size,
                got: self.pending.len(),
            })
        }
    }
}

impl FrameSource for FifoReader {
    fn poll_frame(&mut self) -> Result<Ingest> {
        if self.eof {
            return Ok(Ingest::EndOfStream);
        }
        if !self.is_readable()? {
            return Ok(Ingest::Pending);
        }

        let mut chunk = vec![0u8; self.frame_size - self.pending.len()];
        while !chunk.is_empty() {
            match self.file.read(&mut chunk) {
                Ok(0) => return self.finish_eof(),
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    chunk.truncate(chunk.len() - n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Ingest::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let frame = self.pending.split().freeze();
        self.pending.reserve(self.frame_size);
        Ok(Ingest::Frame(frame))
    }
}

/// Something that can report whether the producer has gone away.
pub trait ProducerStatus {
    fn has_exited(&mut self) -> Result<bool>;
}

impl ProducerStatus for crate::capture::process::PipelineProcess {
    fn has_exited(&mut self) -> Result<bool> {
        crate::capture::process::PipelineProcess::has_exited(self)
    }
}

/// Ingests frames from the session fifo while watching the pipeline.
///
/// If every stage has exited and the fifo has nothing left, the transcoder
/// either never opened its end or already closed it, and the stream is
/// reported finished rather than polled forever.
pub struct FrameIngestor<'p, P: ProducerStatus> {
    reader: FifoReader,
    producer: &'p mut P,
}

impl<'p, P: ProducerStatus> FrameIngestor<'p, P> {
    pub fn new(reader: FifoReader, producer: &'p mut P) -> Self {
        Self { reader, producer }
    }
}

impl<P: ProducerStatus> FrameSource for FrameIngestor<'_, P> {
    fn poll_frame(&mut self) -> Result<Ingest> {
        match self.reader.poll_frame()? {
            Ingest::Pending if self.producer.has_exited()? => {
                // The last writes may have landed after the first check
                match self.reader.poll_frame()? {
                    Ingest::Pending => {
                        info!("Pipeline exited without closing the frame fifo");
                        self.reader.finish_eof()
                    }
                    other => Ok(other),
                }
            }
            other => Ok(other),
        }
    }
}
