//! Conductor: an agent orchestration loop.
//!
//! Drives a conversational model through request/response turns, dispatches
//! the tool calls it asks for (behind an approval gate for sensitive tools),
//! folds results back into the conversation and repeats until the task is
//! done, the budget runs out or something unrecoverable happens. Sub-tasks
//! can be delegated to nested, independently budgeted loops.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use conductor::prelude::*;
//! use conductor::gateway::ScriptedGateway;
//!
//! # async fn example() -> conductor::error::Result<()> {
//! let gateway = Arc::new(ScriptedGateway::new([GatewayResponse::final_text("Done.")]));
//! let agent = AgentLoop::builder()
//!     .gateway(gateway)
//!     .config(LoopConfig::load()?)
//!     .build();
//!
//! let outcome = agent.run("Summarize the release notes").await;
//! println!("{:?}: {}", outcome.status, outcome.content.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod approval;
pub mod budget;
pub mod config;
pub mod conversation;
pub mod delegation;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod prelude;
pub mod streaming;
pub mod tools;
pub mod types;
pub mod util;
