//! Tools the agent can call: trait, parameters, validation and the registry.

pub mod arguments;
pub mod registry;
pub mod tool;
pub mod types;
pub mod validation;

pub use arguments::ToolArguments;
pub use registry::ToolRegistry;
pub use tool::{AgentTool, Tool, ToolExecutionContext};
pub use types::{ParameterBuilder, Sensitivity, ToolDescriptor, ToolParameters};
pub use validation::validate_arguments;
