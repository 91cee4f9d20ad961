//! Model-driven investigation of a single device.
//!
//! The chat model picks tools from the registry; each requested call is checked, dispatched by
//! name and its result fed back as a `tool` message until the model answers in plain text or
//! the round limit is hit.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::backend::{ChatReply, ToolCall};
use crate::error::Result;
use crate::netdetect::validate_target_ip;
use crate::tools::{ToolInput, ToolName, ToolRegistry};

/// Chat rounds before the investigation gives up waiting for a final answer.
pub const MAX_ITERATIONS: usize = 25;

const SYSTEM_PROMPT: &str = "You are a home network security analyst. Use the available tools \
to inspect the device you are given. Only call tools for that device. When you have enough \
evidence, reply without tool calls: summarise the risks and the fixes, most urgent first.";

/// A chat backend that understands function-calling tool definitions.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat_with_tools(&self, messages: &[Value], tools: &[Value]) -> Result<ChatReply>;
}

/// One tool call and what came back.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolStep {
    pub tool: String,
    pub ok: bool,
    /// Tool output as JSON, or an error string.
    pub output: Value,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Investigation {
    pub ip: String,
    pub summary: Option<String>,
    pub steps: Vec<ToolStep>,
    pub rounds: usize,
    /// The round limit was reached before a final answer.
    pub exhausted: bool,
}

#[derive(Deserialize, Default)]
struct CallArgs {
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    open_ports: Option<Vec<u16>>,
}

fn wire_call(call: &ToolCall) -> Value {
    json!({
        "id": call.id,
        "type": "function",
        "function": { "name": call.name, "arguments": call.arguments }
    })
}

pub struct Investigator {
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    max_iterations: usize,
}

impl Investigator {
    pub fn new(model: Arc<dyn ChatModel>, tools: ToolRegistry) -> Self {
        Self {
            model,
            tools,
            max_iterations: MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n.max(1);
        self
    }

    /// Let the model drive tools against `target` until it answers in plain text.
    pub async fn investigate(&self, target: &ToolInput) -> Result<Investigation> {
        let definitions = ToolName::definitions();
        let mut messages = vec![
            json!({ "role": "system", "content": SYSTEM_PROMPT }),
            json!({
                "role": "user",
                "content": format!(
                    "Investigate the device at {}. Open TCP ports: {:?}.",
                    target.ip, target.open_ports
                ),
            }),
        ];
        let mut result = Investigation {
            ip: target.ip.clone(),
            summary: None,
            steps: Vec::new(),
            rounds: 0,
            exhausted: true,
        };

        while result.rounds < self.max_iterations {
            result.rounds += 1;
            let reply = self.model.chat_with_tools(&messages, &definitions).await?;
            if reply.tool_calls.is_empty() {
                result.summary = reply.content.filter(|c| !c.trim().is_empty());
                result.exhausted = false;
                break;
            }

            messages.push(json!({
                "role": "assistant",
                "content": reply.content,
                "tool_calls": reply.tool_calls.iter().map(wire_call).collect::<Vec<_>>(),
            }));
            for call in &reply.tool_calls {
                let step = self.dispatch(call, target).await;
                let content = match &step.output {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                messages.push(json!({ "role": "tool", "tool_call_id": call.id, "content": content }));
                result.steps.push(step);
            }
        }

        if result.exhausted {
            warn!(ip = %target.ip, rounds = result.rounds, "investigation hit the round limit");
        } else {
            info!(ip = %target.ip, rounds = result.rounds, tools = result.steps.len(), "investigation finished");
        }
        Ok(result)
    }

    async fn dispatch(&self, call: &ToolCall, target: &ToolInput) -> ToolStep {
        debug!(tool = %call.name, args = %call.arguments, "tool call");
        let refuse = |why: String| ToolStep {
            tool: call.name.clone(),
            ok: false,
            output: Value::String(format!("error: {why}")),
        };

        let args: CallArgs = if call.arguments.trim().is_empty() {
            CallArgs::default()
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(a) => a,
                Err(e) => return refuse(format!("arguments are not valid JSON: {e}")),
            }
        };
        if let Some(ip) = &args.ip {
            let addr = match validate_target_ip(ip) {
                Ok(addr) => addr,
                Err(e) => return refuse(e.to_string()),
            };
            if addr.to_string() != target.ip {
                return refuse(format!("{addr} is not the device under investigation"));
            }
        }

        let mut input = target.clone();
        if let Some(ports) = args.open_ports {
            input.open_ports = ports;
        }
        match self.tools.run_named(&call.name, &input).await {
            Ok(out) => match serde_json::to_value(&out) {
                Ok(output) => ToolStep {
                    tool: call.name.clone(),
                    ok: true,
                    output,
                },
                Err(e) => refuse(e.to_string()),
            },
            Err(e) => refuse(e.to_string()),
        }
    }
}
