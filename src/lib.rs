pub mod config;
pub mod node;
pub mod error;

pub use config::Config;
pub use node::Node;
pub use error::{GlusterError, Result};

// Re-export key types from workspace crates
pub use storage;
pub use consensus;
pub use api;
pub use network;
