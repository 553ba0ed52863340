pub mod extender;
pub mod nodes;

// Re-export handler functions
pub use extender::*;
pub use nodes::*;
