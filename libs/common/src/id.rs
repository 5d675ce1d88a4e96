//! Identifier validation for the persistent store
//!
//! Rows are keyed by UUIDs. Malformed identifiers are rejected here so that
//! callers never issue a query that cannot match.

use uuid::Uuid;

/// Returns true when `value` parses as a store identifier.
pub fn is_valid_id(value: &str) -> bool {
    parse_id(value).is_some()
}

/// Parse a store identifier, returning `None` for malformed input.
pub fn parse_id(value: &str) -> Option<Uuid> {
    Uuid::parse_str(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_generated_ids() {
        let id = Uuid::new_v4();
        assert!(is_valid_id(&id.to_string()));
        assert!(is_valid_id(&id.simple().to_string()));
        assert_eq!(parse_id(&id.to_string()), Some(id));
    }

    #[test]
    fn test_rejects_malformed_ids() {
        for value in [
            "",
            "not-an-id",
            "5f0c3a9e8d534a5b9d4e0b7f4c1c2d3",
            "5f0c3a9e-8d53-4a5b-9d4e-0b7f4c1c2d3z",
            "507f1f77bcf86cd799439011",
        ] {
            assert!(!is_valid_id(value), "{value:?} should be rejected");
            assert_eq!(parse_id(value), None);
        }
    }
}
