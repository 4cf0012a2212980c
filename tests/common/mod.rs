//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conductor::agent_loop::{LoopEvent, LoopEventSink};
use conductor::tools::{AgentTool, ToolParameters, ToolRegistry};
use conductor::types::{RiskLevel, ToolCall};
use serde_json::json;

/// Counts handler invocations of the tools it builds.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// `echo(text)`: returns `{"echo": text}` after `delay_ms` (optional argument).
pub fn echo_tool(counter: &Counter) -> AgentTool {
    let counter = counter.clone();
    AgentTool::new(
        "echo",
        "Echo the text back",
        ToolParameters::object()
            .string("text", "Text to echo", true)
            .integer("delay_ms", "Artificial latency", false)
            .build(),
        move |args, _ctx| {
            let counter = counter.clone();
            async move {
                counter.bump();
                if let Ok(ms) = args.get_i64("delay_ms") {
                    tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                }
                Ok(json!({ "echo": args.get_str("text")? }))
            }
        },
    )
}

/// `delete_file(path)`: sensitive, high risk, irreversible.
pub fn delete_tool(counter: &Counter) -> AgentTool {
    let counter = counter.clone();
    AgentTool::new(
        "delete_file",
        "Delete a file",
        ToolParameters::object()
            .string("path", "File to delete", true)
            .build(),
        move |args, _ctx| {
            let counter = counter.clone();
            async move {
                counter.bump();
                Ok(json!({ "deleted": args.get_str("path")? }))
            }
        },
    )
    .sensitive(RiskLevel::High, false)
}

/// `fail()`: always returns a handler error.
pub fn failing_tool() -> AgentTool {
    AgentTool::new("fail", "Always fails", ToolParameters::empty(), |_, _| async {
        Err(conductor::error::ConductorError::handler("fail", "disk full"))
    })
}

pub fn registry(tools: Vec<AgentTool>) -> ToolRegistry {
    tools
        .into_iter()
        .try_fold(ToolRegistry::new(), |registry, tool| {
            registry.with_tool(Arc::new(tool))
        })
        .unwrap()
}

pub fn echo_call(id: &str, text: &str) -> ToolCall {
    ToolCall::new(id, "echo", json!({ "text": text }))
}

/// Records every loop event it receives.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<LoopEvent>>>);

impl EventLog {
    pub fn sink(&self) -> LoopEventSink {
        let events = self.0.clone();
        Arc::new(move |event: LoopEvent| events.lock().unwrap().push(event))
    }

    pub fn events(&self) -> Vec<LoopEvent> {
        self.0.lock().unwrap().clone()
    }
}
