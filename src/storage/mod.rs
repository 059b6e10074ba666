mod block_log;

pub use block_log::{BlockLog, BlockLogError};
