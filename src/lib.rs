pub mod compiler;
pub mod config;
pub mod dependencies;
pub mod error;
pub mod lockfile;
pub mod observability;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod registry;
pub mod schema;
pub mod validation;

pub use compiler::build_pipeline;
pub use dependencies::ComponentDependencies;
pub use error::BuildError;
pub use pipeline::{BuiltNode, ExecutionResult, PipelineConfig, PipelineContext};
pub use registry::PluginRegistry;
pub use schema::Schema;
