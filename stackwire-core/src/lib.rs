pub mod buffer_pool;
pub mod byte_queue;
pub mod error;
pub mod prelude;

pub use buffer_pool::BufferPool;
pub use byte_queue::{ByteQueue, LimitedReader, QueueReader, QueueWriter, Underflow};
pub use error::{CloseCause, StackError};
