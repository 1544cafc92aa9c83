pub mod branch_cache;
pub mod memory;
pub mod memory_documents;
pub mod postgres;
pub mod traits;

pub use branch_cache::*;
pub use memory::*;
pub use memory_documents::*;
pub use postgres::*;
pub use traits::*;
