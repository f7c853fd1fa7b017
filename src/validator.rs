use tracing::warn;

use crate::types::ChainEvent;

/// Required `data` fields for one known event type.
#[derive(Debug, Clone, Copy)]
pub struct EventRule {
    pub name: &'static str,
    pub required: &'static [&'static str],
}

/// Structural validation strategy for one contract's event stream.
///
/// Validation is a conjunction of required-field presence checks. Unknown
/// event names pass with a warning so contract upgrades that add events do
/// not silently stall ingestion; this permissive default is deliberate.
#[derive(Debug, Clone)]
pub struct EventValidator {
    contract: String,
    rules: &'static [EventRule],
}

impl EventValidator {
    pub fn new(contract: impl Into<String>, rules: &'static [EventRule]) -> Self {
        Self {
            contract: contract.into(),
            rules,
        }
    }

    pub fn validate(&self, event: &ChainEvent) -> bool {
        let Some(rule) = self.rules.iter().find(|rule| rule.name == event.name) else {
            warn!(
                contract = %self.contract,
                event = %event.name,
                "unknown event type, accepting by default"
            );
            return true;
        };

        // A payload that is not an object cannot satisfy field checks;
        // shape mismatches are invalid, never a panic.
        let Some(data) = event.data.as_object() else {
            return false;
        };

        rule.required.iter().all(|field| data.contains_key(*field))
    }

    pub fn known_events(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RULES: &[EventRule] = &[EventRule {
        name: "Transfer",
        required: &["from", "to", "tokenId"],
    }];

    fn event(name: &str, data: serde_json::Value) -> ChainEvent {
        ChainEvent {
            name: name.to_string(),
            data,
            block_number: 1,
            transaction_hash: "0xdead".to_string(),
        }
    }

    #[test]
    fn accepts_event_with_required_fields() {
        let validator = EventValidator::new("nft", RULES);
        let ok = event("Transfer", json!({"from": "0x1", "to": "0x2", "tokenId": "3"}));
        assert!(validator.validate(&ok));
    }

    #[test]
    fn rejects_event_missing_required_field() {
        let validator = EventValidator::new("nft", RULES);
        let missing = event("Transfer", json!({"from": "0x1", "tokenId": "3"}));
        assert!(!validator.validate(&missing));
    }

    #[test]
    fn unknown_event_is_valid_by_default() {
        let validator = EventValidator::new("nft", RULES);
        let unknown = event("Minted", json!({"whatever": 1}));
        assert!(validator.validate(&unknown));
    }

    #[test]
    fn malformed_data_is_invalid_not_a_panic() {
        let validator = EventValidator::new("nft", RULES);
        assert!(!validator.validate(&event("Transfer", json!([1, 2, 3]))));
        assert!(!validator.validate(&event("Transfer", json!("nope"))));
        assert!(!validator.validate(&event("Transfer", json!(null))));
    }
}
