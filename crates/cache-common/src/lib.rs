//! Common types shared by the block cache and the remote file manager.

pub mod clock;
pub mod error;
pub mod key;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, CacheResult};
pub use key::{hash_identity, BlockKey, ContentVersion};
