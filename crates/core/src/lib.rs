pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{DispatchError, DispatchResult};
pub use types::{
    BatchItemError, BatchItemResult, DeadLetterEntry, FailureClass, FailureRecord, MessageStatus, OutboundMessage, QueueStats,
    QueueStatus, SendReceipt, SendRequest,
};
