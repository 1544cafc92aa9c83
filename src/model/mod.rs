pub mod branch;
pub mod commit;
pub mod common;
pub mod lock;
pub mod merge;
pub mod proposal;

pub use branch::*;
pub use commit::*;
pub use common::*;
pub use lock::*;
pub use merge::*;
pub use proposal::*;
