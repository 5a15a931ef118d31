//! Out-of-process work: the preprocess pool and the indexer children.
//!
//! Both post typed events back onto the server loop and never touch
//! scheduler state directly.

pub mod preprocess;
pub mod runner;

pub use preprocess::PreprocessPool;
pub use runner::LocalRunner;
