use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Primary-key position. Source tables are walked by integer key.
pub type Key = i64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null_or_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(value) => value.is_empty(),
            Self::Blob(value) => value.is_empty(),
            Self::Integer(_) | Self::Real(_) => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value:?}"),
            Self::Blob(value) => write!(f, "<{} bytes>", value.len()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Snapshot of one source row taken at read time. Never mutated in place;
/// tasks turn it into a [`Directive`].
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: Key,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Row {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(FieldValue::as_text)
    }
}

pub type FieldMap = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Skip,
    /// New values for the source row, matched by key.
    Update(FieldMap),
    /// Remove the source row, matched by key.
    Delete,
    Insert {
        table: String,
        values: FieldMap,
    },
}

impl Directive {
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Update(_) => "update",
            Self::Delete => "delete",
            Self::Insert { .. } => "insert",
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip | Self::Delete => f.write_str(self.label()),
            Self::Update(values) => write!(f, "update {}", render_fields(values)),
            Self::Insert { table, values } => {
                write!(f, "insert into {table} {}", render_fields(values))
            }
        }
    }
}

fn render_fields(values: &FieldMap) -> String {
    let parts = values
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>();
    format!("{{{}}}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_text_reads_only_text_fields() {
        let row = Row::new(7)
            .with_field("up_property", "skin")
            .with_field("up_count", 3_i64);
        assert_eq!(row.text("up_property"), Some("skin"));
        assert_eq!(row.text("up_count"), None);
        assert_eq!(row.text("missing"), None);
    }

    #[test]
    fn null_or_empty_covers_blank_text() {
        assert!(FieldValue::Null.is_null_or_empty());
        assert!(FieldValue::from("").is_null_or_empty());
        assert!(!FieldValue::from("x").is_null_or_empty());
        assert!(!FieldValue::Integer(0).is_null_or_empty());
    }

    #[test]
    fn directive_display_lists_fields() {
        let mut values = FieldMap::new();
        values.insert("old_text".to_string(), FieldValue::from("DB://c2/1"));
        assert_eq!(
            Directive::Update(values).to_string(),
            "update {old_text=\"DB://c2/1\"}"
        );
        assert_eq!(Directive::Delete.to_string(), "delete");
    }
}
