//! Client for the HomeGuard backend: threat-intel feeds, device inference and the chat model.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::agent::ChatModel;
use crate::collectors::{DeviceInference, InferenceRequest, ReasoningService, ThreatIntelSource};
use crate::error::{Error, Result};
use crate::threat_intel::{ThreatIntel, ThreatKind};
use crate::types::{Confidence, IdentificationResult, UNKNOWN, UNKNOWN_DEVICE};

/// One tool invocation requested by the chat model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as sent by the model.
    pub arguments: String,
}

/// A chat completion reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatReply {
    pub content: Option<String>,
    pub role: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireChat {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl ChatReply {
    /// Decode the backend `/api/chat` body.
    pub fn from_json(body: &str) -> Result<Self> {
        let wire: WireChat =
            serde_json::from_str(body).map_err(|e| Error::malformed("chat", e.to_string()))?;
        let tool_calls = wire
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: match tc.function.arguments {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
            })
            .collect();
        Ok(Self {
            content: wire.message.content,
            role: wire.message.role.unwrap_or_else(|| "assistant".to_string()),
            tool_calls,
            finish_reason: wire.finish_reason,
        })
    }
}

fn json_array_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").expect("array regex"))
}

/// Pull the first JSON string array out of free model text.
pub fn extract_string_array(text: &str) -> Result<Vec<String>> {
    let m = json_array_re()
        .find(text)
        .ok_or_else(|| Error::malformed("chat", "no JSON array in reply"))?;
    serde_json::from_str::<Vec<String>>(m.as_str())
        .map_err(|e| Error::malformed("chat", e.to_string()))
}

#[derive(Deserialize)]
struct InferenceReply {
    #[serde(default)]
    device_type: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
}

/// Decode an inference body. The result may sit under `identification` or at the top level.
pub fn parse_inference(body: Value) -> Result<Option<IdentificationResult>> {
    let inner = match body {
        Value::Object(mut map) => match map.remove("identification") {
            Some(v @ Value::Object(_)) => v,
            _ => Value::Object(map),
        },
        other => {
            return Err(Error::malformed("inference", format!("expected object, got {other}")))
        }
    };
    let reply: InferenceReply =
        serde_json::from_value(inner).map_err(|e| Error::malformed("inference", e.to_string()))?;
    let Some(device_type) = reply.device_type.filter(|t| !t.is_empty() && t != UNKNOWN_DEVICE) else {
        return Ok(None);
    };
    Ok(Some(IdentificationResult {
        device_type,
        vendor: reply
            .vendor
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_string()),
        confidence: reply
            .confidence
            .as_deref()
            .map(Confidence::parse_lenient)
            .unwrap_or(Confidence::Medium),
        indicators: Default::default(),
    }))
}

const RECOMMENDATION_PROMPT: &str = "You are a cybersecurity consultant. Generate prioritized \
security recommendations based on the network scan results.

## SCAN SUMMARY
{summary}

## RECOMMENDATION REQUIREMENTS
1. Prioritize by risk level: CRITICAL, HIGH, MEDIUM, LOW
2. Be device-specific: mention exact IP addresses and device types
3. Provide actionable steps, not generic advice
4. Limit to 5-8 most important recommendations

## OUTPUT FORMAT
Respond with ONLY a JSON array of strings, each prefixed with its priority, for example:
[\"CRITICAL: Update router firmware at 192.168.1.1 - 3 CVEs found\"]";

#[derive(Clone)]
pub struct BackendClient {
    base: Url,
    client: Client,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid backend url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("backend url {base_url} cannot be a base")));
        }
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("HomeGuard/1.0")
            .build()?;
        Ok(Self { base, client })
    }

    /// Join path segments onto the base URL, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub async fn chat(&self, messages: Value) -> Result<ChatReply> {
        self.post_chat(json!({ "messages": messages })).await
    }

    async fn post_chat(&self, body: Value) -> Result<ChatReply> {
        let resp = self
            .client
            .post(self.endpoint(&["api", "chat"]))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        ChatReply::from_json(&resp.text().await?)
    }
}

#[async_trait]
impl ChatModel for BackendClient {
    async fn chat_with_tools(&self, messages: &[Value], tools: &[Value]) -> Result<ChatReply> {
        self.post_chat(json!({ "messages": messages, "tools": tools })).await
    }
}

#[async_trait]
impl ThreatIntelSource for BackendClient {
    async fn query(&self, subject: &str, kind: ThreatKind) -> Result<ThreatIntel> {
        let url = self.endpoint(&["api", "threat", kind.as_str(), subject]);
        debug!(%url, "threat intel query");
        let body: Value = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !body.is_object() {
            return Err(Error::malformed("threat intel", "expected a JSON object"));
        }
        serde_json::from_value(body).map_err(|e| Error::malformed("threat intel", e.to_string()))
    }
}

#[async_trait]
impl DeviceInference for BackendClient {
    async fn infer_device_type(
        &self,
        request: &InferenceRequest,
    ) -> Result<Option<IdentificationResult>> {
        let body: Value = self
            .client
            .post(self.endpoint(&["api", "identify", "device"]))
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_inference(body)
    }
}

#[async_trait]
impl ReasoningService for BackendClient {
    async fn recommendations(&self, summary: &str) -> Result<Vec<String>> {
        let prompt = RECOMMENDATION_PROMPT.replace("{summary}", summary);
        let reply = self
            .chat(json!([{ "role": "user", "content": prompt }]))
            .await?;
        extract_string_array(reply.content.as_deref().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_reply_with_tool_calls() {
        let body = r#"{
            "message": {
                "content": null,
                "role": "assistant",
                "tool_calls": [
                    {"id": "c1", "type": "function",
                     "function": {"name": "router-scan", "arguments": "{\"ip\":\"192.168.1.1\"}"}}
                ]
            },
            "finish_reason": "tool_calls"
        }"#;
        let reply = ChatReply::from_json(body).unwrap();
        assert_eq!(reply.role, "assistant");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "router-scan");
        assert_eq!(reply.tool_calls[0].arguments, r#"{"ip":"192.168.1.1"}"#);
        assert_eq!(reply.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn chat_reply_rejects_wrong_shape() {
        assert!(matches!(
            ChatReply::from_json(r#"{"choices": []}"#),
            Err(Error::MalformedResponse { .. })
        ));
    }

    #[test]
    fn array_is_found_inside_prose() {
        let text = "Sure, here you go:\n[\"CRITICAL: close telnet\", \"LOW: label devices\"]\nThanks";
        assert_eq!(
            extract_string_array(text).unwrap(),
            vec!["CRITICAL: close telnet", "LOW: label devices"]
        );
        assert!(extract_string_array("nothing useful").is_err());
    }

    #[test]
    fn inference_nested_and_flat() {
        let nested = json!({"identification": {"device_type": "Smart Plug", "vendor": "TP-Link", "confidence": "high"}});
        let r = parse_inference(nested).unwrap().unwrap();
        assert_eq!(r.device_type, "Smart Plug");
        assert_eq!(r.confidence, Confidence::High);

        let flat = json!({"device_type": "Printer"});
        let r = parse_inference(flat).unwrap().unwrap();
        assert_eq!(r.vendor, "Unknown");
        assert_eq!(r.confidence, Confidence::Medium);

        assert_eq!(parse_inference(json!({"device_type": "Unknown Device"})).unwrap(), None);
        assert!(parse_inference(json!([1, 2])).is_err());
    }

    #[test]
    fn endpoint_encodes_segments() {
        let b = BackendClient::new("http://10.0.0.5:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            b.endpoint(&["api", "threat", "vendor", "tp-link Archer C7"]).as_str(),
            "http://10.0.0.5:8000/api/threat/vendor/tp-link%20Archer%20C7"
        );
    }
}
