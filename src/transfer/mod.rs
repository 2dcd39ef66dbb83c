//! Concurrent execution of signed transfers.

pub mod engine;
pub mod error;
pub mod event;
pub mod item;
pub mod pipeline;
pub mod progress;
pub mod transport;

pub use engine::{BatchHandle, BatchOutcome, BatchResult, ItemResult, RetryPolicy, TransferEngine};
pub use error::{BatchError, ItemError};
pub use event::{ChannelSink, CompletedItem, EventSink, ItemRef, LifecycleEvent, NullSink};
pub use item::{Endpoint, TransferItem, UploadSource};
pub use pipeline::KeyMaterial;
pub use progress::{BatchState, ItemStatus, ProgressWatcher};
pub use transport::{ByteStream, SignedRequestExecutor, TransportError};
