pub mod dispatcher;
pub mod execution;

pub use dispatcher::Dispatcher;
pub use execution::{ExecutionEngine, ExecutionEvent};
