pub mod types;
pub mod script;

pub use types::*;
pub use script::Script;
