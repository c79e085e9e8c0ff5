pub mod decomposer;
pub mod execution;
pub mod manager;
pub mod queue;
pub mod types;


pub use decomposer::*;
pub use execution::*;
pub use manager::*;
pub use queue::*;
pub use types::*;
