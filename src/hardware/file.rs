//! File-backed device: raw interleaved little-endian `sc16`.
//!
//! In receive mode the file is read block by block and ends with `EndOfStream`; in transmit
//! mode every buffer is appended to the file. Useful for feeding recorded IQ from other tools
//! into the capture pipeline, or for dumping a replay to disk for inspection.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::core::{SampleBuffer, BYTES_PER_SAMPLE};
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::{
    Direction, ReadOutcome, SampleDevice, StreamParams, WriteOutcome,
};

enum Stream {
    Idle,
    Reading(BufReader<File>),
    Writing(BufWriter<File>),
}

/// Raw `sc16` file standing in for a radio.
pub struct FileDevice {
    path: PathBuf,
    stream: Stream,
    samples: u64,
}

impl FileDevice {
    /// Create a device bound to `path`; the file is opened by `start_streaming`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            stream: Stream::Idle,
            samples: 0,
        }
    }
}

/// Fill `buf` as far as the reader allows; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl SampleDevice for FileDevice {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn start_streaming(&mut self, params: &StreamParams) -> DeviceResult<StreamParams> {
        params.validate()?;
        self.stream = match params.direction {
            Direction::Rx => Stream::Reading(BufReader::with_capacity(
                1024 * 1024,
                File::open(&self.path)?,
            )),
            Direction::Tx => Stream::Writing(BufWriter::with_capacity(
                1024 * 1024,
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&self.path)?,
            )),
        };
        self.samples = 0;
        info!(path = %self.path.display(), direction = ?params.direction, "File device streaming");
        Ok(params.clone())
    }

    fn read_buffer(&mut self, capacity: usize) -> DeviceResult<ReadOutcome> {
        let Stream::Reading(reader) = &mut self.stream else {
            return Err(DeviceError::NotStreaming {
                message: format!("{} is not open for reading", self.path.display()),
            });
        };
        let mut bytes = vec![0u8; capacity * BYTES_PER_SAMPLE];
        let n = read_full(reader, &mut bytes)?;
        let whole = n - n % BYTES_PER_SAMPLE;
        if whole == 0 {
            return Ok(ReadOutcome::EndOfStream);
        }
        self.samples += (whole / BYTES_PER_SAMPLE) as u64;
        Ok(ReadOutcome::Samples(SampleBuffer::samples_from_le_bytes(
            &bytes[..whole],
        )))
    }

    fn write_buffer(&mut self, buffer: &SampleBuffer) -> DeviceResult<WriteOutcome> {
        let Stream::Writing(writer) = &mut self.stream else {
            return Err(DeviceError::NotStreaming {
                message: format!("{} is not open for writing", self.path.display()),
            });
        };
        let mut bytes = Vec::with_capacity(buffer.samples.len() * 2);
        buffer.write_le_bytes(&mut bytes);
        writer.write_all(&bytes)?;
        self.samples += buffer.len() as u64;
        Ok(WriteOutcome::Sent)
    }

    fn flush(&mut self) -> DeviceResult<()> {
        if let Stream::Writing(writer) = &mut self.stream {
            writer.flush()?;
        }
        Ok(())
    }

    fn stop(&mut self) -> DeviceResult<()> {
        if let Stream::Writing(mut writer) = std::mem::replace(&mut self.stream, Stream::Idle) {
            writer.flush()?;
        }
        debug!(path = %self.path.display(), samples = self.samples, "File device stopped");
        Ok(())
    }

    fn paces_output(&self) -> bool {
        false
    }
}
