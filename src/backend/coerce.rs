use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::backend::cell_value::{self, CellValue};
use crate::backend::column_type::ColumnType;

/// A stored value that could not be converted while a column changed type.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoercionIssue {
    pub record_oid: i64,
    pub column_name: String,
    pub original_value: Value,
    pub reason: String,
}

/// Outcome of converting one stored value between column types.
#[derive(Clone, Debug, PartialEq)]
pub enum Coercion {
    /// The stored value is already in the target form.
    Keep,
    /// The stored value must be replaced by this one.
    Replace(Value),
    /// The value is dropped without being reported.
    Discard,
    /// The value cannot be represented; it is nulled and reported.
    Failed(String),
}

/// Converts a stored value of a column of type `from` to a value of type `to`.
pub fn coerce(value: &Value, from: &ColumnType, to: &ColumnType) -> Coercion {
    if value.is_null() {
        return Coercion::Keep;
    }

    match to {
        ColumnType::Lookup(_) => {
            // Lookup values are computed on read
            return Coercion::Discard;
        },
        ColumnType::LinkedTable(to_cfg) => {
            // Raw values are discarded unless they already reference the same table
            let same_target = match from.linked_table_config() {
                Some(from_cfg) => from_cfg.linked_table_id == to_cfg.linked_table_id,
                None => false
            };
            if !same_target {
                return Coercion::Discard;
            }
            let ids = cell_value::linked_ids_of(value);
            if to_cfg.allow_multiple {
                return replace_if_changed(value, Value::Array(ids.into_iter().map(Value::from).collect()));
            }
            return match ids.len() {
                0 => Coercion::Replace(Value::Null),
                1 => replace_if_changed(value, Value::from(ids[0])),
                n => Coercion::Failed(format!("{n} linked records cannot be kept in a single-link column"))
            };
        },
        ColumnType::Checkbox => {
            return replace_if_changed(value, Value::Bool(truthy(value)));
        },
        ColumnType::Text | ColumnType::Url => {
            return match cell_value::display_json(value) {
                Some(s) => replace_if_changed(value, Value::String(s)),
                None => Coercion::Replace(Value::Null)
            };
        },
        ColumnType::Email | ColumnType::Phone => {
            let text = match cell_value::display_json(value) {
                Some(s) => Value::String(s),
                None => { return Coercion::Replace(Value::Null); }
            };
            return normalize(value, &text, to);
        },
        ColumnType::Json => {
            return Coercion::Keep;
        },
        ColumnType::Rating(cfg) if from.linked_table_config().is_none() => {
            // Scores are rounded to the nearest step before the range is checked
            if let Some(n) = cell_value::number_of(value) {
                return normalize(value, &cell_value::number_to_json(cfg.round(n)), to);
            }
        },
        ColumnType::Year => {
            // A date keeps its year
            if let Some(d) = value.as_str().and_then(cell_value::parse_date) {
                return normalize(value, &Value::from(d.year()), to);
            }
        },
        _ => {}
    }

    // Linked ids carry no meaning in any other type
    if from.linked_table_config().is_some() {
        return Coercion::Discard;
    }
    return normalize(value, value, to);
}

fn normalize(original: &Value, candidate: &Value, to: &ColumnType) -> Coercion {
    return match CellValue::from_json(candidate, to) {
        Ok(Some(v)) => replace_if_changed(original, v.to_json()),
        Ok(None) => Coercion::Replace(Value::Null),
        Err(reason) => Coercion::Failed(reason)
    };
}

fn replace_if_changed(original: &Value, converted: Value) -> Coercion {
    if *original == converted {
        return Coercion::Keep;
    }
    return Coercion::Replace(converted);
}

/// Truthiness used when any value becomes a checkbox.
pub fn truthy(value: &Value) -> bool {
    return match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            !matches!(s.as_str(), "" | "false" | "0" | "no" | "off" | "n" | "f")
        },
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    };
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use crate::backend::column_type::{LinkedTableConfig, LookupConfig, RatingConfig, SelectConfig};
    use super::*;

    fn linked(table: i64, allow_multiple: bool) -> ColumnType {
        ColumnType::LinkedTable(LinkedTableConfig {
            linked_table_id: table,
            linked_column_id: None,
            display_column_id: None,
            allow_multiple,
        })
    }

    #[test]
    fn text_to_number_parses_or_fails() {
        assert_eq!(coerce(&json!("42"), &ColumnType::Text, &ColumnType::Number), Coercion::Replace(json!(42)));
        assert!(matches!(coerce(&json!("abc"), &ColumnType::Text, &ColumnType::Number), Coercion::Failed(_)));
        assert_eq!(coerce(&json!(7), &ColumnType::Currency, &ColumnType::Number), Coercion::Keep);
    }

    #[test]
    fn anything_stringifies_to_text() {
        assert_eq!(coerce(&json!(42), &ColumnType::Number, &ColumnType::Text), Coercion::Replace(json!("42")));
        assert_eq!(coerce(&json!(true), &ColumnType::Checkbox, &ColumnType::Text), Coercion::Replace(json!("true")));
        assert_eq!(coerce(&json!(["a", "b"]), &ColumnType::MultiSelect(SelectConfig::default()), &ColumnType::Text), Coercion::Replace(json!("a, b")));
        assert_eq!(coerce(&json!("x"), &ColumnType::Number, &ColumnType::Text), Coercion::Keep);
    }

    #[test]
    fn anything_becomes_a_boolean_by_truthiness() {
        assert_eq!(coerce(&json!("yes"), &ColumnType::Text, &ColumnType::Checkbox), Coercion::Replace(json!(true)));
        assert_eq!(coerce(&json!("off"), &ColumnType::Text, &ColumnType::Checkbox), Coercion::Replace(json!(false)));
        assert_eq!(coerce(&json!(0), &ColumnType::Number, &ColumnType::Checkbox), Coercion::Replace(json!(false)));
        assert_eq!(coerce(&json!(true), &ColumnType::Checkbox, &ColumnType::Checkbox), Coercion::Keep);
    }

    #[test]
    fn raw_values_are_discarded_by_linked_and_lookup_types() {
        let lookup = ColumnType::Lookup(LookupConfig {
            linked_table_id: 1,
            lookup_column_id: 2,
            lookup_column_name: "Name".into(),
            link_column_id: None,
        });
        assert_eq!(coerce(&json!("abc"), &ColumnType::Text, &lookup), Coercion::Discard);
        assert_eq!(coerce(&json!("5"), &ColumnType::Text, &linked(1, false)), Coercion::Discard);
        assert_eq!(coerce(&json!(5), &linked(1, false), &ColumnType::Number), Coercion::Discard);
    }

    #[test]
    fn links_are_reshaped_within_the_same_target() {
        assert_eq!(coerce(&json!(5), &linked(1, false), &linked(1, true)), Coercion::Replace(json!([5])));
        assert_eq!(coerce(&json!([5]), &linked(1, true), &linked(1, false)), Coercion::Replace(json!(5)));
        assert!(matches!(coerce(&json!([5, 6]), &linked(1, true), &linked(1, false)), Coercion::Failed(_)));
        assert_eq!(coerce(&json!([5]), &linked(1, true), &linked(2, true)), Coercion::Discard);
    }

    #[test]
    fn null_is_always_kept() {
        assert_eq!(coerce(&Value::Null, &ColumnType::Text, &ColumnType::Date), Coercion::Keep);
    }

    #[test]
    fn dates_and_selects_validate_on_retype() {
        assert_eq!(coerce(&json!("2024-01-31"), &ColumnType::Text, &ColumnType::Date), Coercion::Keep);
        assert!(matches!(coerce(&json!("soon"), &ColumnType::Text, &ColumnType::Date), Coercion::Failed(_)));
        let select = ColumnType::SingleSelect(SelectConfig { options: vec!["low".into(), "high".into()] });
        assert_eq!(coerce(&json!("low"), &ColumnType::Text, &select), Coercion::Keep);
        assert!(matches!(coerce(&json!("medium"), &ColumnType::Text, &select), Coercion::Failed(_)));
        assert!(matches!(coerce(&json!("nobody"), &ColumnType::Text, &ColumnType::Email), Coercion::Failed(_)));
    }

    #[test]
    fn phones_are_stringified_then_checked() {
        assert_eq!(coerce(&json!(5550100), &ColumnType::Number, &ColumnType::Phone), Coercion::Replace(json!("5550100")));
        assert_eq!(coerce(&json!("+44 20 7946 0000"), &ColumnType::Text, &ColumnType::Phone), Coercion::Keep);
        assert!(matches!(coerce(&json!("ask reception"), &ColumnType::Text, &ColumnType::Phone), Coercion::Failed(_)));
        assert_eq!(coerce(&json!("555-0100"), &ColumnType::Phone, &ColumnType::Text), Coercion::Keep);
    }

    #[test]
    fn ratings_round_numeric_sources() {
        let rating = ColumnType::Rating(RatingConfig::default());
        assert_eq!(coerce(&json!(3.6), &ColumnType::Number, &rating), Coercion::Replace(json!(4)));
        assert_eq!(coerce(&json!("2.2"), &ColumnType::Text, &rating), Coercion::Replace(json!(2)));
        assert_eq!(coerce(&json!(5), &ColumnType::Percent, &rating), Coercion::Keep);
        assert!(matches!(coerce(&json!(8), &ColumnType::Number, &rating), Coercion::Failed(_)));
        assert!(matches!(coerce(&json!("great"), &ColumnType::Text, &rating), Coercion::Failed(_)));
        assert_eq!(coerce(&json!(3), &linked(1, false), &rating), Coercion::Discard);
        let halves = ColumnType::Rating(RatingConfig { max_stars: 5, allow_half: true });
        assert_eq!(coerce(&json!(3.3), &ColumnType::Number, &halves), Coercion::Replace(json!(3.5)));
    }

    #[test]
    fn dates_become_their_year() {
        assert_eq!(coerce(&json!("2024-03-09"), &ColumnType::Date, &ColumnType::Year), Coercion::Replace(json!(2024)));
        assert_eq!(coerce(&json!("1999"), &ColumnType::Text, &ColumnType::Year), Coercion::Replace(json!(1999)));
        assert_eq!(coerce(&json!(1999), &ColumnType::Number, &ColumnType::Year), Coercion::Keep);
        assert!(matches!(coerce(&json!(1999.5), &ColumnType::Number, &ColumnType::Year), Coercion::Failed(_)));
        assert_eq!(coerce(&json!(2024), &ColumnType::Year, &ColumnType::Text), Coercion::Replace(json!("2024")));
    }

    #[test]
    fn times_normalize_from_text() {
        assert_eq!(coerce(&json!("7:45 PM"), &ColumnType::Text, &ColumnType::Time), Coercion::Replace(json!("19:45:00")));
        assert_eq!(coerce(&json!("19:45:00"), &ColumnType::Text, &ColumnType::Time), Coercion::Keep);
        assert!(matches!(coerce(&json!(1945), &ColumnType::Number, &ColumnType::Time), Coercion::Failed(_)));
    }
}
