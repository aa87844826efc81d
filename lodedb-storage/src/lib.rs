pub mod buf;
pub mod conf;
pub mod error;
pub mod journal;
pub mod serde;
pub mod tree;

pub mod prelude {
    pub use crate::buf::*;
    pub use crate::conf::*;
    pub use crate::error::*;
    pub use crate::journal::storage::{FileLogStorage, LogStorage, MemLogStorage};
    pub use crate::journal::loggable::{Loggable, NULL_ADDRESS};
    pub use crate::journal::Log;
    pub use crate::tree::*;
}
