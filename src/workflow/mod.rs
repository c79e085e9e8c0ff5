pub mod coordinator;
pub mod registry;
pub mod types;
pub mod validation;


pub use coordinator::*;
pub use registry::*;
pub use types::*;
pub use validation::*;
