//! Audio subsystem module

pub mod buffer;
#[cfg(feature = "device")]
pub mod device;
pub mod format;
pub mod simulated;
pub mod sink;
pub mod source;

pub use buffer::{BufferPool, BufferState, PcmBuffer};
#[cfg(feature = "device")]
pub use device::{list_output_devices, DeviceOutputSink, DeviceSinkFactory, OutputDeviceInfo};
pub use format::{ByteOrder, PcmFormat};
pub use simulated::{SimulatedCapabilities, SimulatedOutputSink};
pub use sink::{EnqueueError, OutputSink, SinkCallbacks, SinkFactory};
pub use source::{AssetByteSource, AssetStore, DirAssetStore, MemoryAssetStore};
