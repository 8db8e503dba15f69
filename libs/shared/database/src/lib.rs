pub mod query;
pub mod supabase;

pub use query::{Order, RowQuery};
pub use supabase::{SupabaseApiError, SupabaseClient};
