pub mod batch;
pub mod callbacks;
pub mod error;
pub mod ids;

pub use batch::{Event, EventBatch, JsonEvent};
pub use callbacks::{ConnectionCallbacks, LoggingCallbacks};
pub use error::{HecError, HecServerError, ServerErrorType};
pub use ids::{AckId, BatchId, ChannelId};
