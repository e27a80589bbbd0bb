use serde_json::Value;

pub const ERROR_MARKER: &str = "error_code";

/// Decoded partner response. The API reports logical failures with an
/// `error_code` key, even on HTTP 200.
#[derive(Debug, Clone, PartialEq)]
pub enum PartnerResponse {
    Success {
        raw: Value,
    },
    Failure {
        code: String,
        kind: String,
        description: String,
        raw: Value,
    },
}

impl PartnerResponse {
    pub fn from_value(raw: Value) -> Self {
        let Some(code) = raw.get(ERROR_MARKER) else {
            return PartnerResponse::Success { raw };
        };
        PartnerResponse::Failure {
            code: text_of(Some(code)),
            kind: text_of(raw.get("error_type")),
            description: text_of(raw.get("error_description")),
            raw,
        }
    }

    pub fn raw(&self) -> &Value {
        match self {
            PartnerResponse::Success { raw } | PartnerResponse::Failure { raw, .. } => raw,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PartnerResponse::Failure { .. })
    }
}

/// Strings verbatim; numbers and other scalars as their JSON text; absent or
/// null as empty.
fn text_of(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Error codes arrive in inconsistent casing and separators
/// (`INVALID_REQUEST`, `Invalid request`); store them in one form.
pub fn normalize_error_code(code: &str) -> String {
    code.replace('_', " ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_without_marker() {
        let raw = json!({"correlationId": "52b0", "merchantId": "4548436161"});
        let resp = PartnerResponse::from_value(raw.clone());
        assert_eq!(resp, PartnerResponse::Success { raw });
        assert!(!resp.is_failure());
    }

    #[test]
    fn failure_copies_fields() {
        let raw = json!({
            "error_code": "1040012",
            "error_type": "Invalid request",
            "error_description": "Merchant ID already registered, updated, or deleted.",
            "correlationId": "5bd5af1f-c456-4edd-8ec6-ec33a5d0f731",
        });
        match PartnerResponse::from_value(raw.clone()) {
            PartnerResponse::Failure {
                code,
                kind,
                description,
                raw: kept,
            } => {
                assert_eq!(code, "1040012");
                assert_eq!(kind, "Invalid request");
                assert_eq!(
                    description,
                    "Merchant ID already registered, updated, or deleted."
                );
                assert_eq!(kept, raw);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn numeric_code_and_missing_fields() {
        let resp = PartnerResponse::from_value(json!({"error_code": 1040012}));
        match resp {
            PartnerResponse::Failure {
                code,
                kind,
                description,
                ..
            } => {
                assert_eq!(code, "1040012");
                assert!(kind.is_empty());
                assert!(description.is_empty());
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn normalizes_codes() {
        assert_eq!(normalize_error_code("1040012"), "1040012");
        assert_eq!(normalize_error_code("INVALID_REQUEST"), "invalid request");
    }
}
