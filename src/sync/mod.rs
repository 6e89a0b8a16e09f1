pub mod scheduler;

pub use scheduler::{CompletionFuture, WaitScheduler};
