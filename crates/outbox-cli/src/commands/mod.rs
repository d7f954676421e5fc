pub mod cancel;
pub mod clear;
pub mod common;
pub mod completions;
pub mod enqueue;
pub mod list;
pub mod retry;
pub mod status;
pub mod sync;
