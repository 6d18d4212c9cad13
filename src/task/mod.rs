pub mod clock;
pub mod condition;
pub mod deferred;
pub mod graph;
pub mod priority;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod types;

pub use clock::*;
pub use condition::*;
pub use deferred::*;
pub use graph::*;
pub use priority::*;
pub use registry::*;
pub use scheduler::*;
pub use supervisor::*;
pub use types::*;
