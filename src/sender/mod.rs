pub mod batch;
pub mod batching;

pub use batch::{estimate_entry_bytes, BatchLimits, DeliveryStatus, Receipt, ENTRY_OVERHEAD_BYTES};
pub use batching::{BatchingSender, SendError, SenderSettings};
