//! Property-based test generators using proptest.

use proptest::prelude::*;
use rusqlite::types::Value;

/// Strategy for table and column names the assembler must quote.
pub fn identifier_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_ \"]{0,15}")
        .expect("Invalid regex")
        .prop_filter("Reserved names are not user tables", |name| {
            !name.to_ascii_lowercase().starts_with("sqlite_")
        })
}

/// Strategy for a single column value of any storage class.
///
/// Reals are finite so rows compare equal after a round trip.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e12f64..1.0e12).prop_map(Value::Real),
        ".{0,64}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..256).prop_map(Value::Blob),
    ]
}

/// Strategy for rows of `width` columns.
pub fn rows_strategy(width: usize, max_rows: usize) -> impl Strategy<Value = Vec<Vec<Value>>> {
    prop::collection::vec(prop::collection::vec(value_strategy(), width), 0..max_rows)
}

/// Strategy for text long enough to spill onto overflow pages.
pub fn overflow_text_strategy(page_size: usize) -> impl Strategy<Value = String> {
    (page_size..page_size * 4).prop_map(|len| "x".repeat(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn test_identifiers_are_not_reserved(name in identifier_strategy()) {
            prop_assert!(!name.is_empty());
            prop_assert!(!name.to_ascii_lowercase().starts_with("sqlite_"));
        }

        #[test]
        fn test_rows_have_requested_width(rows in rows_strategy(3, 8)) {
            prop_assert!(rows.iter().all(|row| row.len() == 3));
        }
    }
}
