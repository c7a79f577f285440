use serde::{Serialize, Deserialize};
use crate::util::error;

/// The type tag of a column, as it appears in requests and in storage.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Email,
    Url,
    Phone,
    Number,
    Currency,
    Percent,
    Rating,
    #[serde(alias = "boolean")]
    Checkbox,
    Date,
    Time,
    Year,
    Json,
    #[serde(alias = "select")]
    SingleSelect,
    MultiSelect,
    #[serde(alias = "linkedTable")]
    LinkedTable,
    Lookup,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        return match self {
            Self::Text => "text",
            Self::Email => "email",
            Self::Url => "url",
            Self::Phone => "phone",
            Self::Number => "number",
            Self::Currency => "currency",
            Self::Percent => "percent",
            Self::Rating => "rating",
            Self::Checkbox => "checkbox",
            Self::Date => "date",
            Self::Time => "time",
            Self::Year => "year",
            Self::Json => "json",
            Self::SingleSelect => "single_select",
            Self::MultiSelect => "multi_select",
            Self::LinkedTable => "linked_table",
            Self::Lookup => "lookup",
        }
    }

    /// Converts the DATA_TYPE stored in the column metadata.
    pub fn from_database(data_type: &str) -> Option<DataType> {
        return match data_type {
            "text" => Some(Self::Text),
            "email" => Some(Self::Email),
            "url" => Some(Self::Url),
            "phone" => Some(Self::Phone),
            "number" => Some(Self::Number),
            "currency" => Some(Self::Currency),
            "percent" => Some(Self::Percent),
            "rating" => Some(Self::Rating),
            "checkbox" => Some(Self::Checkbox),
            "date" => Some(Self::Date),
            "time" => Some(Self::Time),
            "year" => Some(Self::Year),
            "json" => Some(Self::Json),
            "single_select" => Some(Self::SingleSelect),
            "multi_select" => Some(Self::MultiSelect),
            "linked_table" => Some(Self::LinkedTable),
            "lookup" => Some(Self::Lookup),
            _ => None
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SelectConfig {
    #[serde(default)]
    pub options: Vec<String>,
}

impl SelectConfig {
    /// Whether a value is one of the configured options. An empty option list accepts anything.
    pub fn allows(&self, value: &str) -> bool {
        return self.options.is_empty() || self.options.iter().any(|o| o == value);
    }
}

/// Largest scale a rating column can be configured with.
pub const MAX_RATING_SCALE: u8 = 10;

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RatingConfig {
    #[serde(default = "default_max_stars")]
    pub max_stars: u8,
    /// Accepts half steps such as 3.5.
    #[serde(default)]
    pub allow_half: bool,
}

fn default_max_stars() -> u8 {
    return 5;
}

impl Default for RatingConfig {
    fn default() -> RatingConfig {
        return RatingConfig { max_stars: default_max_stars(), allow_half: false };
    }
}

impl RatingConfig {
    /// Rounds a score to the nearest step the column accepts.
    pub fn round(&self, score: f64) -> f64 {
        if self.allow_half {
            return (score * 2.0).round() / 2.0;
        }
        return score.round();
    }

    pub fn allows(&self, score: f64) -> bool {
        return score >= 0.0 && score <= f64::from(self.max_stars) && self.round(score) == score;
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LinkedTableConfig {
    pub linked_table_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_column_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_column_id: Option<i64>,
    #[serde(default)]
    pub allow_multiple: bool,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LookupConfig {
    pub linked_table_id: i64,
    pub lookup_column_id: i64,
    /// Cached name of the projected column; refreshed when that column is renamed.
    #[serde(default)]
    pub lookup_column_name: String,
    /// The linked column on the lookup's own table that is followed. Resolved when the
    /// lookup is created if not given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_column_id: Option<i64>,
}

/// A column type together with its type-specific configuration.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(into = "ColumnTypeParts", try_from = "ColumnTypeParts")]
pub enum ColumnType {
    Text,
    Email,
    Url,
    Phone,
    Number,
    Currency,
    Percent,
    Rating(RatingConfig),
    Checkbox,
    Date,
    Time,
    Year,
    Json,
    SingleSelect(SelectConfig),
    MultiSelect(SelectConfig),
    LinkedTable(LinkedTableConfig),
    Lookup(LookupConfig),
}

/// The wire shape of a column type: the type tag next to optional per-type configs.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ColumnTypeParts {
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select_config: Option<SelectConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_table_config: Option<LinkedTableConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_config: Option<LookupConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_config: Option<RatingConfig>,
}

impl ColumnTypeParts {
    pub fn new(data_type: DataType) -> ColumnTypeParts {
        return ColumnTypeParts {
            data_type,
            select_config: None,
            linked_table_config: None,
            lookup_config: None,
            rating_config: None,
        };
    }
}

impl From<ColumnType> for ColumnTypeParts {
    fn from(column_type: ColumnType) -> ColumnTypeParts {
        let mut parts = ColumnTypeParts::new(column_type.data_type());
        match column_type {
            ColumnType::SingleSelect(cfg) | ColumnType::MultiSelect(cfg) => {
                parts.select_config = Some(cfg);
            },
            ColumnType::LinkedTable(cfg) => {
                parts.linked_table_config = Some(cfg);
            },
            ColumnType::Lookup(cfg) => {
                parts.lookup_config = Some(cfg);
            },
            ColumnType::Rating(cfg) => {
                parts.rating_config = Some(cfg);
            },
            _ => {}
        }
        return parts;
    }
}

impl TryFrom<ColumnTypeParts> for ColumnType {
    type Error = error::Error;

    fn try_from(parts: ColumnTypeParts) -> Result<ColumnType, error::Error> {
        return ColumnType::from_parts(parts);
    }
}

impl ColumnType {
    /// Builds a column type from its tag and whatever configs were supplied.
    /// Configs that do not belong to the tag are ignored.
    pub fn from_parts(parts: ColumnTypeParts) -> Result<ColumnType, error::Error> {
        return Ok(match parts.data_type {
            DataType::Text => Self::Text,
            DataType::Email => Self::Email,
            DataType::Url => Self::Url,
            DataType::Phone => Self::Phone,
            DataType::Number => Self::Number,
            DataType::Currency => Self::Currency,
            DataType::Percent => Self::Percent,
            DataType::Rating => {
                let cfg = parts.rating_config.unwrap_or_default();
                if cfg.max_stars < 1 || cfg.max_stars > MAX_RATING_SCALE {
                    return Err(error::Error::Validation(format!("ratingConfig.maxStars must be between 1 and {MAX_RATING_SCALE}")));
                }
                Self::Rating(cfg)
            },
            DataType::Checkbox => Self::Checkbox,
            DataType::Date => Self::Date,
            DataType::Time => Self::Time,
            DataType::Year => Self::Year,
            DataType::Json => Self::Json,
            DataType::SingleSelect => Self::SingleSelect(parts.select_config.unwrap_or_default()),
            DataType::MultiSelect => Self::MultiSelect(parts.select_config.unwrap_or_default()),
            DataType::LinkedTable => {
                match parts.linked_table_config {
                    Some(cfg) => Self::LinkedTable(cfg),
                    None => {
                        return Err(error::Error::Validation("linkedTableConfig.linkedTableId is required for linked_table columns".into()));
                    }
                }
            },
            DataType::Lookup => {
                match parts.lookup_config {
                    Some(cfg) => Self::Lookup(cfg),
                    None => {
                        return Err(error::Error::Validation("lookupConfig with linkedTableId and lookupColumnId is required for lookup columns".into()));
                    }
                }
            }
        });
    }

    /// Converts a type from the DATA_TYPE and CONFIG stored in the column metadata.
    pub fn from_database(data_type: &str, config: Option<&str>) -> Result<ColumnType, error::Error> {
        let data_type = match DataType::from_database(data_type) {
            Some(t) => t,
            None => {
                return Err(error::Error::Validation(format!("unknown stored data type '{data_type}'")));
            }
        };
        let mut parts = ColumnTypeParts::new(data_type);
        if let Some(c) = config {
            match data_type {
                DataType::SingleSelect | DataType::MultiSelect => { parts.select_config = Some(serde_json::from_str(c)?); },
                DataType::LinkedTable => { parts.linked_table_config = Some(serde_json::from_str(c)?); },
                DataType::Lookup => { parts.lookup_config = Some(serde_json::from_str(c)?); },
                DataType::Rating => { parts.rating_config = Some(serde_json::from_str(c)?); },
                _ => {}
            }
        }
        return Self::from_parts(parts);
    }

    /// Serializes the type-specific configuration for the CONFIG column of the metadata.
    pub fn config_to_database(&self) -> Result<Option<String>, error::Error> {
        return Ok(match self {
            Self::SingleSelect(cfg) | Self::MultiSelect(cfg) => Some(serde_json::to_string(cfg)?),
            Self::LinkedTable(cfg) => Some(serde_json::to_string(cfg)?),
            Self::Lookup(cfg) => Some(serde_json::to_string(cfg)?),
            Self::Rating(cfg) => Some(serde_json::to_string(cfg)?),
            _ => None
        });
    }

    pub fn data_type(&self) -> DataType {
        return match self {
            Self::Text => DataType::Text,
            Self::Email => DataType::Email,
            Self::Url => DataType::Url,
            Self::Phone => DataType::Phone,
            Self::Number => DataType::Number,
            Self::Currency => DataType::Currency,
            Self::Percent => DataType::Percent,
            Self::Rating(_) => DataType::Rating,
            Self::Checkbox => DataType::Checkbox,
            Self::Date => DataType::Date,
            Self::Time => DataType::Time,
            Self::Year => DataType::Year,
            Self::Json => DataType::Json,
            Self::SingleSelect(_) => DataType::SingleSelect,
            Self::MultiSelect(_) => DataType::MultiSelect,
            Self::LinkedTable(_) => DataType::LinkedTable,
            Self::Lookup(_) => DataType::Lookup,
        }
    }

    pub fn select_config(&self) -> Option<&SelectConfig> {
        return match self {
            Self::SingleSelect(cfg) | Self::MultiSelect(cfg) => Some(cfg),
            _ => None
        }
    }

    pub fn linked_table_config(&self) -> Option<&LinkedTableConfig> {
        return match self {
            Self::LinkedTable(cfg) => Some(cfg),
            _ => None
        }
    }

    pub fn rating_config(&self) -> Option<&RatingConfig> {
        return match self {
            Self::Rating(cfg) => Some(cfg),
            _ => None
        }
    }

    pub fn lookup_config(&self) -> Option<&LookupConfig> {
        return match self {
            Self::Lookup(cfg) => Some(cfg),
            _ => None
        }
    }

    /// Lookup values are computed on read and never stored in a record.
    pub fn is_computed(&self) -> bool {
        return matches!(self, Self::Lookup(_));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use super::*;

    #[test]
    fn data_type_accepts_spec_aliases() {
        let t: DataType = serde_json::from_value(json!("boolean")).unwrap();
        assert_eq!(t, DataType::Checkbox);
        let t: DataType = serde_json::from_value(json!("linkedTable")).unwrap();
        assert_eq!(t, DataType::LinkedTable);
        let t: DataType = serde_json::from_value(json!("select")).unwrap();
        assert_eq!(t, DataType::SingleSelect);
    }

    #[test]
    fn linked_type_without_config_is_a_validation_error() {
        let err = ColumnType::from_parts(ColumnTypeParts::new(DataType::LinkedTable)).unwrap_err();
        assert!(matches!(err, error::Error::Validation(_)));
        let err = ColumnType::from_parts(ColumnTypeParts::new(DataType::Lookup)).unwrap_err();
        assert!(matches!(err, error::Error::Validation(_)));
    }

    #[test]
    fn stored_config_survives_database_round_trip() {
        let column_type = ColumnType::LinkedTable(LinkedTableConfig {
            linked_table_id: 4,
            linked_column_id: None,
            display_column_id: Some(9),
            allow_multiple: true,
        });
        let config = column_type.config_to_database().unwrap();
        let restored = ColumnType::from_database("linked_table", config.as_deref()).unwrap();
        assert_eq!(restored, column_type);
    }

    #[test]
    fn column_type_serializes_as_tag_plus_config() {
        let column_type = ColumnType::SingleSelect(SelectConfig { options: vec!["a".into()] });
        let v = serde_json::to_value(&column_type).unwrap();
        assert_eq!(v, json!({"dataType": "single_select", "selectConfig": {"options": ["a"]}}));
        let v = serde_json::to_value(ColumnType::Number).unwrap();
        assert_eq!(v, json!({"dataType": "number"}));
    }

    #[test]
    fn select_config_with_no_options_accepts_anything() {
        assert!(SelectConfig::default().allows("whatever"));
        let cfg = SelectConfig { options: vec!["red".into(), "blue".into()] };
        assert!(cfg.allows("red"));
        assert!(!cfg.allows("Red"));
    }

    #[test]
    fn rating_scale_defaults_and_is_bounded() {
        let rating: ColumnType = serde_json::from_value(json!({"dataType": "rating"})).unwrap();
        assert_eq!(rating.rating_config().map(|c| c.max_stars), Some(5));
        let config = rating.config_to_database().unwrap();
        assert_eq!(ColumnType::from_database("rating", config.as_deref()).unwrap(), rating);

        let mut parts = ColumnTypeParts::new(DataType::Rating);
        parts.rating_config = Some(RatingConfig { max_stars: 11, allow_half: false });
        assert!(matches!(ColumnType::from_parts(parts), Err(error::Error::Validation(_))));
        let v = serde_json::to_value(ColumnType::Year).unwrap();
        assert_eq!(v, json!({"dataType": "year"}));
    }

    #[test]
    fn rating_steps_follow_the_config() {
        let whole = RatingConfig::default();
        assert!(whole.allows(0.0));
        assert!(whole.allows(5.0));
        assert!(!whole.allows(3.5));
        assert!(!whole.allows(6.0));
        assert_eq!(whole.round(3.6), 4.0);
        let half = RatingConfig { max_stars: 10, allow_half: true };
        assert!(half.allows(3.5));
        assert_eq!(half.round(3.3), 3.5);
    }
}
