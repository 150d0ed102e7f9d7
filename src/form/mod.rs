pub mod scheduler;
pub mod state;
pub mod sync;
