// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Grant file parsing and validation.
//!
//! A grant is the user-signed, content-addressed JSON document that
//! authorizes one application to run one operation over the permitted
//! files. Validation is a pure function of the document, the expected
//! grantee, and the current time so it can be tested exhaustively.

use std::sync::LazyLock;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::error::ServerError;

/// Operation names a grant may carry. Anything else fails validation.
pub const OP_LLM_INFERENCE: &str = "llm_inference";
pub const OP_QWEN_AGENT: &str = "prompt_qwen_agent";
pub const OP_GEMINI_AGENT: &str = "prompt_gemini_agent";

pub const SUPPORTED_OPERATIONS: [&str; 3] = [OP_LLM_INFERENCE, OP_QWEN_AGENT, OP_GEMINI_AGENT];

pub const AGENT_OPERATIONS: [&str; 2] = [OP_QWEN_AGENT, OP_GEMINI_AGENT];

static GRANT_SCHEMA: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
    let schema = json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Data Permission Grant",
        "type": "object",
        "required": ["grantee", "operation", "parameters"],
        "properties": {
            "grantee": {
                "type": "string",
                "pattern": "^0x[0-9a-fA-F]{40}$"
            },
            "operation": {
                "type": "string",
                "minLength": 1
            },
            "parameters": {
                "type": "object",
                "additionalProperties": true
            },
            "expires": {
                "type": "integer",
                "minimum": 0
            }
        },
        "additionalProperties": false
    });
    jsonschema::validator_for(&schema).expect("grant schema is valid")
});

/// Parsed and semantically validated grant file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantFile {
    pub grantee: Address,
    pub operation: String,
    pub parameters: Value,
    pub expires: Option<i64>,
}

impl GrantFile {
    pub fn is_agent_operation(&self) -> bool {
        AGENT_OPERATIONS.contains(&self.operation.as_str())
    }

    /// The free-form goal for agent operations.
    pub fn goal(&self) -> Option<&str> {
        self.parameters.get("goal").and_then(Value::as_str)
    }

    /// The prompt template for the remote-LLM operation.
    pub fn prompt_template(&self) -> Option<&str> {
        self.parameters.get("prompt").and_then(Value::as_str)
    }

    pub fn response_format(&self) -> Option<&Value> {
        self.parameters.get("response_format")
    }
}

/// Validate a raw grant document against the schema and the semantic
/// rules: the grantee must match the on-chain record, the grant must not
/// be expired, and the operation must be one this server can dispatch.
///
/// `now` is POSIX seconds; `expires == now` is still valid.
pub fn validate(raw: &Value, expected_grantee: Address, now: i64) -> Result<GrantFile, ServerError> {
    if !GRANT_SCHEMA.is_valid(raw) {
        return Err(ServerError::GrantValidation(
            "grant file does not match schema".into(),
        ));
    }

    let grant: GrantFile = serde_json::from_value(raw.clone())
        .map_err(|e| ServerError::GrantValidation(format!("grant file parse failed: {e}")))?;

    if !SUPPORTED_OPERATIONS.contains(&grant.operation.as_str()) {
        return Err(ServerError::GrantValidation(format!(
            "unsupported operation: {}",
            grant.operation
        )));
    }

    // Address comparison is case-insensitive by construction: both sides
    // are parsed 20-byte addresses, not strings.
    if grant.grantee != expected_grantee {
        return Err(ServerError::GrantValidation(format!(
            "grantee {} does not match on-chain grantee {}",
            grant.grantee, expected_grantee
        )));
    }

    if let Some(expires) = grant.expires {
        if now > expires {
            return Err(ServerError::GrantValidation(format!(
                "grant expired at {expires} (now {now})"
            )));
        }
    }

    Ok(grant)
}

/// Validate the optional `response_format` parameter.
///
/// Only the remote-LLM operation honors it; agent operations ignore it
/// when present. When set it must be `{"type": "text" | "json_object"}`.
pub fn validate_response_format(grant: &GrantFile) -> Result<(), ServerError> {
    let Some(format) = grant.response_format() else {
        return Ok(());
    };

    if grant.is_agent_operation() {
        tracing::debug!(
            operation = %grant.operation,
            "ignoring response_format for agent operation"
        );
        return Ok(());
    }

    let Some(obj) = format.as_object() else {
        return Err(ServerError::Validation(
            "response_format must be an object".into(),
        ));
    };

    match obj.get("type").and_then(Value::as_str) {
        Some("text") | Some("json_object") => Ok(()),
        Some(other) => Err(ServerError::Validation(format!(
            "response_format.type must be 'text' or 'json_object', got '{other}'"
        ))),
        None => Err(ServerError::Validation(
            "response_format must include a 'type' field".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn grantee() -> Address {
        Address::from_str("0x742d35Cc6634C0532925a3b8D4C9db96C4b4d8b6").unwrap()
    }

    fn raw_grant(operation: &str) -> Value {
        json!({
            "grantee": "0x742d35Cc6634C0532925a3b8D4C9db96C4b4d8b6",
            "operation": operation,
            "parameters": {"prompt": "Summarize {{data}}"}
        })
    }

    #[test]
    fn accepts_valid_grant() {
        let grant = validate(&raw_grant(OP_LLM_INFERENCE), grantee(), 1000).unwrap();
        assert_eq!(grant.operation, OP_LLM_INFERENCE);
        assert_eq!(grant.grantee, grantee());
    }

    #[test]
    fn grantee_comparison_is_case_insensitive() {
        let raw = json!({
            "grantee": "0x742d35cc6634c0532925a3b8d4c9db96c4b4d8b6",
            "operation": OP_LLM_INFERENCE,
            "parameters": {}
        });
        assert!(validate(&raw, grantee(), 1000).is_ok());
    }

    #[test]
    fn rejects_unknown_operation() {
        let err = validate(&raw_grant("train_model"), grantee(), 1000).unwrap_err();
        assert!(matches!(err, ServerError::GrantValidation(_)));
    }

    #[test]
    fn rejects_grantee_mismatch() {
        let other = Address::from_str("0x0000000000000000000000000000000000000001").unwrap();
        let err = validate(&raw_grant(OP_LLM_INFERENCE), other, 1000).unwrap_err();
        assert!(matches!(err, ServerError::GrantValidation(_)));
    }

    #[test]
    fn expiry_boundary() {
        let mut raw = raw_grant(OP_LLM_INFERENCE);
        raw["expires"] = json!(1000);

        // expires == now is accepted
        assert!(validate(&raw, grantee(), 1000).is_ok());
        // one second past is rejected
        assert!(validate(&raw, grantee(), 1001).is_err());
    }

    #[test]
    fn missing_fields_fail_schema() {
        let raw = json!({"grantee": "0x742d35Cc6634C0532925a3b8D4C9db96C4b4d8b6"});
        assert!(validate(&raw, grantee(), 0).is_err());
    }

    #[test]
    fn extra_top_level_fields_fail_schema() {
        let mut raw = raw_grant(OP_LLM_INFERENCE);
        raw["unexpected"] = json!(true);
        assert!(validate(&raw, grantee(), 0).is_err());
    }

    #[test]
    fn response_format_rules() {
        let mut grant = validate(&raw_grant(OP_LLM_INFERENCE), grantee(), 0).unwrap();

        grant.parameters["response_format"] = json!({"type": "json_object"});
        assert!(validate_response_format(&grant).is_ok());

        grant.parameters["response_format"] = json!({"type": "yaml"});
        assert!(validate_response_format(&grant).is_err());

        grant.parameters["response_format"] = json!("json_object");
        assert!(validate_response_format(&grant).is_err());

        grant.parameters["response_format"] = json!({});
        assert!(validate_response_format(&grant).is_err());
    }

    #[test]
    fn agent_operations_ignore_response_format() {
        let mut raw = raw_grant(OP_QWEN_AGENT);
        raw["parameters"] = json!({"goal": "do it", "response_format": {"type": "yaml"}});
        let grant = validate(&raw, grantee(), 0).unwrap();
        assert!(validate_response_format(&grant).is_ok());
    }
}
