pub mod config;
pub mod history;
pub mod list;
pub mod sync;
pub mod task;
