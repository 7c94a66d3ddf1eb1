pub mod classify;
pub mod error;
pub mod matcher;
pub mod persist;
pub mod planner;
pub mod reconcile;
pub mod repack;
pub mod snapshot;
pub mod store;
pub mod tools;
pub mod unpack;
pub mod util;
pub mod walk;

mod superimg;

pub use error::RomforgeError;
pub use repack::{repack, Ext4Mode, RepackOptions};
pub use unpack::unpack;
