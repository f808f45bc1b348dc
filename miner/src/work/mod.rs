//! Work units, nonce ranges, the work queue and the per-thread reader.

pub mod queue;
pub mod range;
pub mod reader;
pub mod unit;

pub use queue::{QueueEvent, QueueState, WorkQueue, DEFAULT_RANGE_SIZE};
pub use range::NonceRange;
pub use reader::{latency_sizer, QueueReader, RangeDelivery, RangeSizer, RangeSource, StopHandle};
pub use unit::{CallbackId, StaleCallback, WorkDescriptor, WorkUnit, MAX_NONCES};
