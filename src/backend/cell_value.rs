use serde_json::{Map, Value};
use time::Date;
use time::OffsetDateTime;
use time::Time;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use crate::backend::column_type::ColumnType;

const DATE_FORMAT: &[BorrowedFormatItem<'_>] = format_description!("[year]-[month]-[day]");
const TIME_FORMAT: &[BorrowedFormatItem<'_>] = format_description!("[hour]:[minute]:[second]");

/// Characters a phone number may hold besides digits.
const PHONE_PUNCTUATION: &[char] = &[' ', '+', '-', '(', ')', '.'];

/// A stored value interpreted through the type of its column.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Boolean(bool),
    Date(Date),
    Time(Time),
    Json(Value),
    Select(String),
    MultiSelect(Vec<String>),
    /// A single-link column's record id.
    Link(i64),
    /// A multi-link column's ordered record ids.
    Links(Vec<i64>),
}

impl CellValue {
    /// Interprets a JSON value as a value of the given column type.
    /// Returns `None` for null (an empty cell) and the reason when the value is not representable.
    pub fn from_json(value: &Value, column_type: &ColumnType) -> Result<Option<CellValue>, String> {
        if value.is_null() {
            return Ok(None);
        }
        match column_type {
            ColumnType::Text | ColumnType::Url => {
                return match scalar_text(value) {
                    Some(s) => Ok(Some(CellValue::Text(s))),
                    None => Err(format!("expected text, got {}", describe(value)))
                };
            },
            ColumnType::Email => {
                return match scalar_text(value) {
                    Some(s) if s.contains('@') => Ok(Some(CellValue::Text(s))),
                    Some(s) => Err(format!("'{s}' is not an email address")),
                    None => Err(format!("expected an email address, got {}", describe(value)))
                };
            },
            ColumnType::Phone => {
                return match scalar_text(value) {
                    Some(s) if is_phone(&s) => Ok(Some(CellValue::Text(s.trim().to_string()))),
                    Some(s) => Err(format!("'{s}' is not a phone number")),
                    None => Err(format!("expected a phone number, got {}", describe(value)))
                };
            },
            ColumnType::Number | ColumnType::Currency | ColumnType::Percent => {
                return match number_of(value) {
                    Some(n) => Ok(Some(CellValue::Number(n))),
                    None => Err(format!("{} is not a number", describe(value)))
                };
            },
            ColumnType::Rating(cfg) => {
                return match number_of(value) {
                    Some(n) if cfg.allows(n) => Ok(Some(CellValue::Number(n))),
                    Some(n) if cfg.allow_half => Err(format!("rating {n} is not a half step between 0 and {}", cfg.max_stars)),
                    Some(n) => Err(format!("rating {n} is not a whole number between 0 and {}", cfg.max_stars)),
                    None => Err(format!("{} is not a rating", describe(value)))
                };
            },
            ColumnType::Year => {
                return match number_of(value) {
                    Some(n) if n.fract() == 0.0 && (1.0..=9999.0).contains(&n) => Ok(Some(CellValue::Number(n))),
                    _ => Err(format!("{} is not a year between 1 and 9999", describe(value)))
                };
            },
            ColumnType::Checkbox => {
                let parsed = match value {
                    Value::Bool(b) => Some(*b),
                    Value::Number(n) => match n.as_f64() {
                        Some(f) if f == 0.0 => Some(false),
                        Some(f) if f == 1.0 => Some(true),
                        _ => None
                    },
                    Value::String(s) => match s.trim().to_lowercase().as_str() {
                        "true" => Some(true),
                        "false" => Some(false),
                        _ => None
                    },
                    _ => None
                };
                return match parsed {
                    Some(b) => Ok(Some(CellValue::Boolean(b))),
                    None => Err(format!("{} is not a boolean", describe(value)))
                };
            },
            ColumnType::Date => {
                let parsed = match value {
                    Value::String(s) => parse_date(s),
                    _ => None
                };
                return match parsed {
                    Some(d) => Ok(Some(CellValue::Date(d))),
                    None => Err(format!("{} is not a date (expected YYYY-MM-DD)", describe(value)))
                };
            },
            ColumnType::Time => {
                let parsed = match value {
                    Value::String(s) => parse_time(s),
                    _ => None
                };
                return match parsed {
                    Some(t) => Ok(Some(CellValue::Time(t))),
                    None => Err(format!("{} is not a time of day (expected HH:MM)", describe(value)))
                };
            },
            ColumnType::Json => {
                return Ok(Some(CellValue::Json(value.clone())));
            },
            ColumnType::SingleSelect(cfg) => {
                return match scalar_text(value) {
                    Some(s) if cfg.allows(&s) => Ok(Some(CellValue::Select(s))),
                    Some(s) => Err(format!("'{s}' is not one of the column's options")),
                    None => Err(format!("expected a single option, got {}", describe(value)))
                };
            },
            ColumnType::MultiSelect(cfg) => {
                let items: Vec<String> = match value {
                    Value::Array(items) => {
                        let mut out = Vec::with_capacity(items.len());
                        for item in items {
                            match scalar_text(item) {
                                Some(s) => out.push(s),
                                None => { return Err(format!("expected options, got {}", describe(item))); }
                            }
                        }
                        out
                    },
                    Value::String(s) => s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect(),
                    _ => { return Err(format!("expected a list of options, got {}", describe(value))); }
                };
                let mut selected: Vec<String> = Vec::with_capacity(items.len());
                for item in items {
                    if !cfg.allows(&item) {
                        return Err(format!("'{item}' is not one of the column's options"));
                    }
                    if !selected.contains(&item) {
                        selected.push(item);
                    }
                }
                return Ok(Some(CellValue::MultiSelect(selected)));
            },
            ColumnType::LinkedTable(cfg) => {
                let ids = match strict_linked_ids(value) {
                    Some(ids) => ids,
                    None => { return Err(format!("{} is not a record id or list of record ids", describe(value))); }
                };
                if cfg.allow_multiple {
                    return Ok(Some(CellValue::Links(ids)));
                }
                return match ids.len() {
                    0 => Ok(None),
                    1 => Ok(Some(CellValue::Link(ids[0]))),
                    _ => Err("column links to a single record but several ids were given".into())
                };
            },
            ColumnType::Lookup(_) => {
                return Err("lookup values are computed and cannot be stored".into());
            }
        }
    }

    /// The canonical stored form.
    pub fn to_json(&self) -> Value {
        return match self {
            Self::Text(s) | Self::Select(s) => Value::String(s.clone()),
            Self::Number(n) => number_to_json(*n),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Date(d) => Value::String(format_date(*d)),
            Self::Time(t) => Value::String(format_time(*t)),
            Self::Json(v) => v.clone(),
            Self::MultiSelect(items) => Value::Array(items.iter().map(|s| Value::String(s.clone())).collect()),
            Self::Link(id) => Value::from(*id),
            Self::Links(ids) => Value::Array(ids.iter().map(|id| Value::from(*id)).collect()),
        }
    }

    /// Record ids held by a linked value; empty for every other kind of value.
    pub fn linked_ids(&self) -> Vec<i64> {
        return match self {
            Self::Link(id) => vec![*id],
            Self::Links(ids) => ids.clone(),
            _ => Vec::new()
        }
    }
}

/// The string representation of any stored value, used for search, labels and stringifying retypes.
pub fn display_json(value: &Value) -> Option<String> {
    return match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => match n.as_f64() {
            Some(f) => Some(format_number(f)),
            None => Some(n.to_string())
        },
        Value::Array(items) => Some(items.iter().filter_map(display_json).collect::<Vec<String>>().join(", ")),
        Value::Object(_) => Some(value.to_string()),
    }
}

/// Case-insensitive substring match of `needle` against every value of a record.
pub fn record_matches(data: &Map<String, Value>, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    return data.values().any(|v| match display_json(v) {
        Some(s) => s.to_lowercase().contains(&needle),
        None => false
    });
}

/// Best-effort extraction of record ids from a stored linked value.
/// Non-id entries are skipped rather than reported.
pub fn linked_ids_of(value: &Value) -> Vec<i64> {
    return match value {
        Value::Array(items) => items.iter().filter_map(id_of).collect(),
        v => id_of(v).into_iter().collect()
    };
}

fn strict_linked_ids(value: &Value) -> Option<Vec<i64>> {
    let mut ids: Vec<i64> = Vec::new();
    let mut push = |id: i64| {
        if !ids.contains(&id) {
            ids.push(id);
        }
    };
    match value {
        Value::Array(items) => {
            for item in items {
                push(id_of(item)?);
            }
        },
        v => push(id_of(v)?)
    }
    return Some(ids);
}

fn id_of(value: &Value) -> Option<i64> {
    return match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None
    };
}

fn scalar_text(value: &Value) -> Option<String> {
    return match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(_) | Value::Bool(_) => display_json(value),
        _ => None
    };
}

/// A number or numeric text.
pub fn number_of(value: &Value) -> Option<f64> {
    return match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None
    };
}

fn is_phone(s: &str) -> bool {
    let s = s.trim();
    let digits = s.chars().filter(|c| c.is_ascii_digit()).count();
    return digits >= 3 && s.chars().all(|c| c.is_ascii_digit() || PHONE_PUNCTUATION.contains(&c));
}

fn describe(value: &Value) -> String {
    return match value {
        Value::Null => "null".into(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("text '{s}'"),
        Value::Array(_) => "a list".into(),
        Value::Object(_) => "an object".into(),
    };
}

pub fn parse_number(s: &str) -> Option<f64> {
    return match s.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => Some(n),
        _ => None
    };
}

/// Integral values are stored as JSON integers so that `42` stays `42`.
pub fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Value::from(n as i64);
    }
    return match serde_json::Number::from_f64(n) {
        Some(num) => Value::Number(num),
        None => Value::Null
    };
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return (n as i64).to_string();
    }
    return n.to_string();
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp (whose date part is kept).
pub fn parse_date(s: &str) -> Option<Date> {
    let s = s.trim();
    if let Ok(d) = Date::parse(s, DATE_FORMAT) {
        return Some(d);
    }
    return OffsetDateTime::parse(s, &Rfc3339).ok().map(|dt| dt.date());
}

pub fn format_date(d: Date) -> String {
    return match d.format(DATE_FORMAT) {
        Ok(s) => s,
        Err(_) => d.to_string()
    };
}

/// Accepts `HH:MM`, `HH:MM:SS`, a 12-hour clock with an AM/PM suffix, or an RFC 3339
/// timestamp (whose time part is kept). Fractions of a second are dropped.
pub fn parse_time(s: &str) -> Option<Time> {
    let s = s.trim();
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        let t = dt.time();
        return Time::from_hms(t.hour(), t.minute(), t.second()).ok();
    }

    let upper = s.to_uppercase();
    let (clock, afternoon) = match upper.strip_suffix("PM") {
        Some(rest) => (rest.trim_end().to_string(), Some(true)),
        None => match upper.strip_suffix("AM") {
            Some(rest) => (rest.trim_end().to_string(), Some(false)),
            None => (upper.clone(), None)
        }
    };
    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 || parts[1..].iter().any(|p| p.len() != 2) {
        return None;
    }
    let mut hour: u8 = parts[0].parse().ok()?;
    let minute: u8 = parts[1].parse().ok()?;
    let second: u8 = match parts.get(2) {
        Some(p) => p.parse().ok()?,
        None => 0
    };

    // 12 AM is midnight and 12 PM is noon
    if let Some(pm) = afternoon {
        if hour == 0 || hour > 12 {
            return None;
        }
        hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h
        };
    }
    return Time::from_hms(hour, minute, second).ok();
}

pub fn format_time(t: Time) -> String {
    return match t.format(TIME_FORMAT) {
        Ok(s) => s,
        Err(_) => t.to_string()
    };
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use crate::backend::column_type::{LinkedTableConfig, RatingConfig, SelectConfig};
    use super::*;

    fn linked(allow_multiple: bool) -> ColumnType {
        ColumnType::LinkedTable(LinkedTableConfig {
            linked_table_id: 1,
            linked_column_id: None,
            display_column_id: None,
            allow_multiple,
        })
    }

    #[test]
    fn numbers_accept_numeric_text_and_store_integers() {
        let v = CellValue::from_json(&json!("42"), &ColumnType::Number).unwrap().unwrap();
        assert_eq!(v.to_json(), json!(42));
        let v = CellValue::from_json(&json!(2.5), &ColumnType::Currency).unwrap().unwrap();
        assert_eq!(v.to_json(), json!(2.5));
        assert!(CellValue::from_json(&json!("abc"), &ColumnType::Number).is_err());
        assert!(CellValue::from_json(&json!("NaN"), &ColumnType::Number).is_err());
    }

    #[test]
    fn null_is_an_empty_cell_for_every_type() {
        assert_eq!(CellValue::from_json(&Value::Null, &ColumnType::Date), Ok(None));
        assert_eq!(CellValue::from_json(&Value::Null, &linked(false)), Ok(None));
    }

    #[test]
    fn dates_normalize_timestamps_to_the_day() {
        let v = CellValue::from_json(&json!("2024-03-09T10:00:00Z"), &ColumnType::Date).unwrap().unwrap();
        assert_eq!(v.to_json(), json!("2024-03-09"));
        assert!(CellValue::from_json(&json!("09/03/2024"), &ColumnType::Date).is_err());
    }

    #[test]
    fn phones_keep_their_punctuation() {
        let v = CellValue::from_json(&json!(" +1 (555) 010-9999 "), &ColumnType::Phone).unwrap().unwrap();
        assert_eq!(v.to_json(), json!("+1 (555) 010-9999"));
        let v = CellValue::from_json(&json!(5550100), &ColumnType::Phone).unwrap().unwrap();
        assert_eq!(v.to_json(), json!("5550100"));
        assert!(CellValue::from_json(&json!("call me"), &ColumnType::Phone).is_err());
        assert!(CellValue::from_json(&json!("12"), &ColumnType::Phone).is_err());
    }

    #[test]
    fn times_are_stored_on_a_24_hour_clock() {
        let cases = [
            ("09:30", "09:30:00"),
            ("23:05:59", "23:05:59"),
            ("9:30 pm", "21:30:00"),
            ("12:00 AM", "00:00:00"),
            ("12:15PM", "12:15:00"),
            ("2024-03-09T10:20:30.5Z", "10:20:30"),
        ];
        for (input, stored) in cases {
            let v = CellValue::from_json(&json!(input), &ColumnType::Time).unwrap().unwrap();
            assert_eq!(v.to_json(), json!(stored), "{input}");
        }
        for bad in ["24:00", "9:5", "13:00 PM", "noon", "10:00:00:00"] {
            assert!(CellValue::from_json(&json!(bad), &ColumnType::Time).is_err(), "{bad}");
        }
        assert!(CellValue::from_json(&json!(930), &ColumnType::Time).is_err());
    }

    #[test]
    fn ratings_and_years_are_bounded_numbers() {
        let rating = ColumnType::Rating(RatingConfig::default());
        assert_eq!(CellValue::from_json(&json!("4"), &rating).unwrap().unwrap().to_json(), json!(4));
        assert!(CellValue::from_json(&json!(6), &rating).is_err());
        assert!(CellValue::from_json(&json!(2.5), &rating).is_err());
        assert!(CellValue::from_json(&json!(-1), &rating).is_err());
        let halves = ColumnType::Rating(RatingConfig { max_stars: 5, allow_half: true });
        assert_eq!(CellValue::from_json(&json!(2.5), &halves).unwrap().unwrap().to_json(), json!(2.5));

        assert_eq!(CellValue::from_json(&json!("1999"), &ColumnType::Year).unwrap().unwrap().to_json(), json!(1999));
        assert!(CellValue::from_json(&json!(0), &ColumnType::Year).is_err());
        assert!(CellValue::from_json(&json!(10_000), &ColumnType::Year).is_err());
        assert!(CellValue::from_json(&json!(2024.5), &ColumnType::Year).is_err());
    }

    #[test]
    fn selects_respect_options() {
        let cfg = SelectConfig { options: vec!["a".into(), "b".into()] };
        let multi = ColumnType::MultiSelect(cfg.clone());
        let v = CellValue::from_json(&json!("a, b, a"), &multi).unwrap().unwrap();
        assert_eq!(v.to_json(), json!(["a", "b"]));
        assert!(CellValue::from_json(&json!("c"), &ColumnType::SingleSelect(cfg)).is_err());
    }

    #[test]
    fn linked_values_follow_column_multiplicity() {
        let v = CellValue::from_json(&json!([3]), &linked(false)).unwrap().unwrap();
        assert_eq!(v, CellValue::Link(3));
        let v = CellValue::from_json(&json!("7"), &linked(true)).unwrap().unwrap();
        assert_eq!(v.to_json(), json!([7]));
        assert!(CellValue::from_json(&json!([1, 2]), &linked(false)).is_err());
        assert!(CellValue::from_json(&json!({"id": 1}), &linked(true)).is_err());
    }

    #[test]
    fn display_and_search_cover_every_value() {
        let mut data = Map::new();
        data.insert("Name".into(), json!("Alpha Widget"));
        data.insert("Qty".into(), json!(12));
        data.insert("Tags".into(), json!(["Red", "Blue"]));
        assert!(record_matches(&data, "widget"));
        assert!(record_matches(&data, "12"));
        assert!(record_matches(&data, "blue"));
        assert!(!record_matches(&data, "green"));
        assert_eq!(display_json(&json!(3.0)), Some("3".into()));
    }

    #[test]
    fn lenient_id_extraction_skips_garbage() {
        assert_eq!(linked_ids_of(&json!([1, "2", "x", null])), vec![1, 2]);
        assert_eq!(linked_ids_of(&json!(5)), vec![5]);
        assert!(linked_ids_of(&json!("nope")).is_empty());
    }
}
