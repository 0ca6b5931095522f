pub mod error;
pub mod node;
pub mod settings;
pub mod slam;
pub mod visualizer;

pub use error::{Result, SlamError};
pub use node::{launch, Node, RunReport};
pub use settings::OperatingProfile;
