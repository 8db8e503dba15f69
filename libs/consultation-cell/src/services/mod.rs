pub mod queue;
pub mod store;
pub mod memory_store;
pub mod supabase_store;
pub mod lifecycle;
pub mod payment;
pub mod listener;
pub mod sweeper;

pub use store::*;
pub use memory_store::*;
pub use supabase_store::*;
pub use lifecycle::*;
pub use payment::*;
pub use listener::*;
pub use sweeper::*;
