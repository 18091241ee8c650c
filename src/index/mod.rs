pub mod manager;
pub mod registry;
mod write_queue;
pub mod writer;

pub use manager::{IndexManager, IndexStats, WorkCompleter, WorkExecutor, WorkFuture};
pub use registry::IndexRegistry;
pub use writer::{ManagedIndexWriter, WriterRegistry};
