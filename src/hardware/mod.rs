//! Radio front-end abstraction.
//!
//! - `capabilities`: the [`SampleDevice`] trait and its stream types
//! - `mock`: synthetic source and in-memory sinks
//! - `file`: raw `sc16` file device
//! - `registry`: connection-string resolution

pub mod capabilities;
pub mod file;
pub mod mock;
pub mod registry;

pub use capabilities::{Direction, ReadOutcome, SampleDevice, StreamParams, WriteOutcome};
pub use file::FileDevice;
pub use mock::{MemorySink, MockSource, MockSourceConfig, NullSink, SinkProbe, Waveform};
pub use registry::{list_drivers, open_device, DeviceArgs, DriverSpec};
