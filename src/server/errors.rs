//! Errors the front server raises for its own requests.

use serde_json::json;

use crate::mcp_client::types::{error_codes, JsonRpcError};

/// A call refused before anything is routed to a child.
///
/// Renders with the same `data` fields as a routed failure, so every error
/// the client sees names what was expected, what arrived and a correct
/// call to copy.
#[derive(Debug, Clone, Default)]
pub(crate) struct InvalidCall {
    pub message: String,
    pub expected: String,
    pub received: String,
    pub example: String,
    pub troubleshooting: Vec<String>,
}

impl InvalidCall {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = expected.into();
        self
    }

    pub fn received(mut self, received: impl Into<String>) -> Self {
        self.received = received.into();
        self
    }

    pub fn example(mut self, example: impl Into<String>) -> Self {
        self.example = example.into();
        self
    }

    pub fn hint(mut self, line: impl Into<String>) -> Self {
        self.troubleshooting.push(line.into());
        self
    }
}

impl From<InvalidCall> for JsonRpcError {
    fn from(call: InvalidCall) -> Self {
        JsonRpcError {
            code: error_codes::INVALID_PARAMS,
            data: Some(json!({
                "message": call.message,
                "troubleshooting": call.troubleshooting,
                "expected": call.expected,
                "received": call.received,
                "example": call.example,
                "stage": "received",
            })),
            message: call.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_full_error_contract() {
        let error: JsonRpcError = InvalidCall::new("tool 'x' is disabled")
            .expected("an enabled tool")
            .received("x")
            .example("mcp__syntropy__syntropy_enable_tools")
            .hint("Re-enable it")
            .into();

        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        assert_eq!(error.message, "tool 'x' is disabled");
        let data = error.data.unwrap();
        assert_eq!(data["message"], "tool 'x' is disabled");
        assert_eq!(data["expected"], "an enabled tool");
        assert_eq!(data["received"], "x");
        assert_eq!(data["example"], "mcp__syntropy__syntropy_enable_tools");
        assert_eq!(data["troubleshooting"], json!(["Re-enable it"]));
    }
}
