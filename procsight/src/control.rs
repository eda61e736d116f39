// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! The controller: parses one newline-framed command message from the
//! control channel and applies it. Incoming messages are JSON objects with a
//! `type` tag and an optional `body`; responses are framed by the reporter
//! when it writes them back.

use serde::Serialize;
use serde_json::Value;

use crate::agent::Agent;
use crate::config::{self, AgentConfig};

/// One parsed control message. Consumed once by [`dispatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    ParseError,
    Malformed,
    Unknown(String),
    ParamError(String),
    SetConfig(Value),
    GetConfig,
    GetDiag,
    BlockPort(u16),
    Switch { urls: bool },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    fn ok() -> Self {
        Self {
            kind: "resp",
            status: 200,
            body: None,
            message: None,
        }
    }

    fn ok_with(body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::ok()
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: "resp",
            status,
            body: None,
            message: Some(message.into()),
        }
    }

    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"resp","status":500,"message":"encode failure"}"#.to_string()
        });
        line.push('\n');
        line
    }
}

/// Parse one message. Never fails: every defect maps onto one of the error
/// request tags so dispatch can answer it.
pub fn parse(message: &str) -> ControlRequest {
    let Ok(value) = serde_json::from_str::<Value>(message.trim_end()) else {
        return ControlRequest::ParseError;
    };
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return ControlRequest::Malformed;
    };
    let body = value.get("body");

    match kind {
        "set-config" => match body {
            Some(body) if body.is_object() => ControlRequest::SetConfig(body.clone()),
            _ => ControlRequest::ParamError("set-config requires an object body".to_string()),
        },
        "get-config" => ControlRequest::GetConfig,
        "get-diag" => ControlRequest::GetDiag,
        "block-port" => {
            let port = body
                .and_then(|b| b.get("port"))
                .and_then(Value::as_u64)
                .or_else(|| body.and_then(Value::as_u64));
            match port {
                Some(port) if port <= u16::MAX as u64 => ControlRequest::BlockPort(port as u16),
                _ => ControlRequest::ParamError("block-port requires a port".to_string()),
            }
        }
        "switch" => {
            let urls = body.and_then(|b| b.get("urls")).and_then(Value::as_bool);
            match urls {
                Some(urls) => ControlRequest::Switch { urls },
                None => ControlRequest::ParamError("switch requires a urls flag".to_string()),
            }
        }
        other => ControlRequest::Unknown(other.to_string()),
    }
}

/// Apply one request. Runs on the reporter thread, which is what allows the
/// set-config path to publish a new configuration.
pub fn dispatch(request: ControlRequest, agent: &Agent) -> Response {
    match request {
        ControlRequest::ParseError => Response::error(400, "message did not parse"),
        ControlRequest::Malformed => Response::error(400, "message has no type"),
        ControlRequest::Unknown(kind) => Response::error(400, format!("unknown command {kind}")),
        ControlRequest::ParamError(what) => Response::error(400, what),
        ControlRequest::SetConfig(body) => {
            let mut cfg = config::with_current(|p| p.cfg.clone())
                .unwrap_or_else(AgentConfig::default);
            match cfg.apply_json(&body) {
                Ok(()) => {
                    config::publish(cfg);
                    log::info!("configuration replaced via control channel");
                    Response::ok()
                }
                Err(err) => Response::error(400, format!("set-config: {err}")),
            }
        }
        ControlRequest::GetConfig => {
            let cfg = config::with_current(|p| p.cfg.clone())
                .unwrap_or_else(AgentConfig::default);
            match serde_json::to_value(&cfg) {
                Ok(body) => Response::ok_with(body),
                Err(err) => Response::error(500, format!("get-config: {err}")),
            }
        }
        // Reserved.
        ControlRequest::GetDiag => Response::ok(),
        ControlRequest::BlockPort(port) => {
            agent.block_port(port);
            log::info!("port block set mutated: {port}");
            Response::ok()
        }
        ControlRequest::Switch { urls } => {
            agent.set_url_capture(urls);
            Response::ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent;

    #[test]
    fn parses_the_request_taxonomy() {
        assert_eq!(parse("not json"), ControlRequest::ParseError);
        assert_eq!(parse(r#"{"body":{}}"#), ControlRequest::Malformed);
        assert_eq!(
            parse(r#"{"type":"self-destruct"}"#),
            ControlRequest::Unknown("self-destruct".to_string())
        );
        assert!(matches!(
            parse(r#"{"type":"set-config"}"#),
            ControlRequest::ParamError(_)
        ));
        assert_eq!(parse(r#"{"type":"get-config"}"#), ControlRequest::GetConfig);
        assert_eq!(parse(r#"{"type":"get-diag"}"#), ControlRequest::GetDiag);
        assert_eq!(
            parse(r#"{"type":"block-port","body":{"port":8080}}"#),
            ControlRequest::BlockPort(8080)
        );
        assert_eq!(
            parse(r#"{"type":"switch","body":{"urls":true}}"#),
            ControlRequest::Switch { urls: true }
        );
    }

    #[test]
    fn set_config_replaces_the_active_config() {
        let _guard = agent::test_guard();
        let agent = agent::test_agent();

        config::publish(AgentConfig {
            metric_dest: "none".to_string(),
            event_dest: "none".to_string(),
            log_dest: "none".to_string(),
            control_dest: "none".to_string(),
            ..Default::default()
        });

        let request = parse("{\"type\":\"set-config\",\"body\":{\"interval\":2}}\n");
        let response = dispatch(request, agent);
        assert_eq!(response.status, 200);
        assert_eq!(config::with_current(|p| p.cfg.interval).unwrap(), 2);

        // get-config reflects the replacement.
        let response = dispatch(ControlRequest::GetConfig, agent);
        assert_eq!(response.status, 200);
        assert_eq!(response.body.unwrap()["interval"], 2);
    }

    #[test]
    fn block_port_and_switch_mutate_runtime_state() {
        let _guard = agent::test_guard();
        let agent = agent::test_agent();

        let response = dispatch(ControlRequest::BlockPort(9443), agent);
        assert_eq!(response.status, 200);
        assert!(agent.port_blocked(9443));
        dispatch(ControlRequest::BlockPort(0), agent);
        assert!(!agent.port_blocked(9443));

        dispatch(ControlRequest::Switch { urls: true }, agent);
        assert!(agent.url_capture());
        dispatch(ControlRequest::Switch { urls: false }, agent);
        assert!(!agent.url_capture());
    }

    #[test]
    fn error_requests_answer_400_and_touch_nothing() {
        let _guard = agent::test_guard();
        let agent = agent::test_agent();
        for request in [
            ControlRequest::ParseError,
            ControlRequest::Malformed,
            ControlRequest::Unknown("x".to_string()),
            ControlRequest::ParamError("y".to_string()),
        ] {
            let response = dispatch(request, agent);
            assert_eq!(response.status, 400);
        }
    }

    #[test]
    fn responses_are_newline_framed_json() {
        let line = Response::ok().to_line();
        assert!(line.ends_with('\n'));
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["type"], "resp");
        assert_eq!(parsed["status"], 200);
    }
}
