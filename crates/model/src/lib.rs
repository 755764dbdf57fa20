pub mod agnostic;
pub mod config;
pub mod output;

pub use agnostic::AgnosticModel;
pub use config::AgnosticConfig;
pub use output::{LaiModel, ModelOutput, ReferencePanel};
