//! Concrete maintenance jobs. Each one is a pure per-row decision; the run
//! loop supplies the cursor, pacing and writes.

use crate::applier::MutationTask;
use crate::row::{Directive, FieldMap, FieldValue, Row};

/// Sets `column` to `to` on every row where it currently equals `from`.
#[derive(Debug, Clone)]
pub struct RewriteField {
    pub table: String,
    pub key_column: String,
    pub column: String,
    pub from: String,
    pub to: String,
}

impl MutationTask for RewriteField {
    fn name(&self) -> &str {
        "rewrite-field"
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn key_column(&self) -> &str {
        &self.key_column
    }

    fn columns(&self) -> Vec<String> {
        vec![self.column.clone()]
    }

    fn describe(&self) -> String {
        format!("{} {:?} -> {:?}", self.column, self.from, self.to)
    }

    fn decide(&self, row: &Row) -> Directive {
        if row.text(&self.column) != Some(self.from.as_str()) {
            return Directive::Skip;
        }
        let mut values = FieldMap::new();
        values.insert(self.column.clone(), FieldValue::from(self.to.as_str()));
        Directive::Update(values)
    }
}

/// Deletes preference rows that merely restate the default value.
#[derive(Debug, Clone)]
pub struct CleanupProperties {
    pub table: String,
    pub key_column: String,
    pub property_column: String,
    pub value_column: String,
    pub properties: Vec<String>,
    pub default_value: String,
}

impl MutationTask for CleanupProperties {
    fn name(&self) -> &str {
        "cleanup-properties"
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn key_column(&self) -> &str {
        &self.key_column
    }

    fn columns(&self) -> Vec<String> {
        vec![self.property_column.clone(), self.value_column.clone()]
    }

    fn describe(&self) -> String {
        let mut properties = self.properties.clone();
        properties.sort();
        format!(
            "{}/{} in [{}] == {:?}",
            self.property_column,
            self.value_column,
            properties.join(","),
            self.default_value
        )
    }

    fn decide(&self, row: &Row) -> Directive {
        let Some(property) = row.text(&self.property_column) else {
            return Directive::Skip;
        };
        if !self.properties.iter().any(|name| name == property) {
            return Directive::Skip;
        }
        if row.text(&self.value_column) == Some(self.default_value.as_str()) {
            Directive::Delete
        } else {
            Directive::Skip
        }
    }
}

/// Rewrites external blob addresses from one storage cluster prefix to another,
/// e.g. `DB://cluster1/123` to `DB://cluster7/123`.
#[derive(Debug, Clone)]
pub struct MigrateBlobRefs {
    pub table: String,
    pub key_column: String,
    pub column: String,
    pub from_prefix: String,
    pub to_prefix: String,
}

impl MutationTask for MigrateBlobRefs {
    fn name(&self) -> &str {
        "migrate-blob-refs"
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn key_column(&self) -> &str {
        &self.key_column
    }

    fn columns(&self) -> Vec<String> {
        vec![self.column.clone()]
    }

    fn describe(&self) -> String {
        format!("{} {:?} -> {:?}", self.column, self.from_prefix, self.to_prefix)
    }

    fn decide(&self, row: &Row) -> Directive {
        let Some(address) = row.text(&self.column) else {
            return Directive::Skip;
        };
        let Some(rest) = address.strip_prefix(&self.from_prefix) else {
            return Directive::Skip;
        };
        if rest.is_empty() {
            return Directive::Skip;
        }
        let mut values = FieldMap::new();
        values.insert(
            self.column.clone(),
            FieldValue::Text(format!("{}{rest}", self.to_prefix)),
        );
        Directive::Update(values)
    }
}

/// One source-to-target column mapping for [`Backfill`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnCopy {
    pub source: String,
    pub target: String,
}

impl ColumnCopy {
    /// Parses `source:target`, or a bare `name` for same-named columns.
    pub fn parse(raw: &str) -> Option<Self> {
        let (source, target) = match raw.split_once(':') {
            Some((source, target)) => (source.trim(), target.trim()),
            None => (raw.trim(), raw.trim()),
        };
        if source.is_empty() || target.is_empty() {
            return None;
        }
        Some(Self {
            source: source.to_string(),
            target: target.to_string(),
        })
    }
}

/// Inserts a row into `target_table` for every source row whose
/// `marker_column` is NULL or empty, copying the mapped columns.
#[derive(Debug, Clone)]
pub struct Backfill {
    pub table: String,
    pub key_column: String,
    pub marker_column: String,
    pub target_table: String,
    pub copies: Vec<ColumnCopy>,
}

impl MutationTask for Backfill {
    fn name(&self) -> &str {
        "backfill"
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn key_column(&self) -> &str {
        &self.key_column
    }

    fn columns(&self) -> Vec<String> {
        let mut columns = vec![self.marker_column.clone()];
        for copy in &self.copies {
            if !columns.contains(&copy.source) {
                columns.push(copy.source.clone());
            }
        }
        columns
    }

    fn describe(&self) -> String {
        let copies = self
            .copies
            .iter()
            .map(|copy| format!("{}:{}", copy.source, copy.target))
            .collect::<Vec<_>>();
        format!(
            "{} empty -> {} [{}]",
            self.marker_column,
            self.target_table,
            copies.join(",")
        )
    }

    fn decide(&self, row: &Row) -> Directive {
        let needs_backfill = row
            .get(&self.marker_column)
            .is_none_or(FieldValue::is_null_or_empty);
        if !needs_backfill {
            return Directive::Skip;
        }
        let values = self
            .copies
            .iter()
            .map(|copy| {
                let value = row.get(&copy.source).cloned().unwrap_or(FieldValue::Null);
                (copy.target.clone(), value)
            })
            .collect::<FieldMap>();
        Directive::Insert {
            table: self.target_table.clone(),
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_field_updates_only_exact_matches() {
        let task = RewriteField {
            table: "page".to_string(),
            key_column: "page_id".to_string(),
            column: "page_lang".to_string(),
            from: "X".to_string(),
            to: "Y".to_string(),
        };
        let mut expected = FieldMap::new();
        expected.insert("page_lang".to_string(), FieldValue::from("Y"));

        assert_eq!(
            task.decide(&Row::new(1).with_field("page_lang", "X")),
            Directive::Update(expected)
        );
        assert_eq!(
            task.decide(&Row::new(2).with_field("page_lang", "x")),
            Directive::Skip
        );
        assert_eq!(task.decide(&Row::new(3)), Directive::Skip);
    }

    fn property_cleanup() -> CleanupProperties {
        CleanupProperties {
            table: "user_properties".to_string(),
            key_column: "rowid".to_string(),
            property_column: "up_property".to_string(),
            value_column: "up_value".to_string(),
            properties: vec!["skin".to_string(), "gender".to_string()],
            default_value: "default".to_string(),
        }
    }

    #[test]
    fn cleanup_properties_deletes_default_values_of_listed_properties() {
        let task = property_cleanup();
        let row = |property: &str, value: &str| {
            Row::new(1)
                .with_field("up_property", property)
                .with_field("up_value", value)
        };
        assert_eq!(task.decide(&row("skin", "default")), Directive::Delete);
        assert_eq!(task.decide(&row("skin", "vector")), Directive::Skip);
        assert_eq!(task.decide(&row("timecorrection", "default")), Directive::Skip);
        assert_eq!(task.decide(&Row::new(2)), Directive::Skip);
    }

    #[test]
    fn cleanup_properties_description_ignores_list_order() {
        let mut reordered = property_cleanup();
        reordered.properties.reverse();
        assert_eq!(property_cleanup().describe(), reordered.describe());
    }

    #[test]
    fn blob_refs_keep_the_object_id() {
        let task = MigrateBlobRefs {
            table: "text".to_string(),
            key_column: "old_id".to_string(),
            column: "old_text".to_string(),
            from_prefix: "DB://cluster1/".to_string(),
            to_prefix: "DB://cluster7/".to_string(),
        };
        let mut expected = FieldMap::new();
        expected.insert("old_text".to_string(), FieldValue::from("DB://cluster7/4411"));

        assert_eq!(
            task.decide(&Row::new(1).with_field("old_text", "DB://cluster1/4411")),
            Directive::Update(expected)
        );
        assert_eq!(
            task.decide(&Row::new(2).with_field("old_text", "DB://cluster2/4411")),
            Directive::Skip
        );
        assert_eq!(
            task.decide(&Row::new(3).with_field("old_text", "DB://cluster1/")),
            Directive::Skip
        );
    }

    #[test]
    fn column_copy_parsing() {
        assert_eq!(
            ColumnCopy::parse("rev_id:slot_revision_id"),
            Some(ColumnCopy {
                source: "rev_id".to_string(),
                target: "slot_revision_id".to_string()
            })
        );
        assert_eq!(
            ColumnCopy::parse("rev_sha1"),
            Some(ColumnCopy {
                source: "rev_sha1".to_string(),
                target: "rev_sha1".to_string()
            })
        );
        assert_eq!(ColumnCopy::parse(":x"), None);
    }

    #[test]
    fn backfill_inserts_for_unmarked_rows() {
        let task = Backfill {
            table: "revision".to_string(),
            key_column: "rev_id".to_string(),
            marker_column: "rev_content_id".to_string(),
            target_table: "slots".to_string(),
            copies: vec![
                ColumnCopy::parse("rev_id:slot_revision_id").expect("copy"),
                ColumnCopy::parse("rev_text_id:slot_content_id").expect("copy"),
            ],
        };
        assert_eq!(
            task.columns(),
            vec!["rev_content_id", "rev_id", "rev_text_id"]
        );

        let unmarked = Row::new(5)
            .with_field("rev_content_id", FieldValue::Null)
            .with_field("rev_id", 5_i64)
            .with_field("rev_text_id", 77_i64);
        let mut expected = FieldMap::new();
        expected.insert("slot_revision_id".to_string(), FieldValue::Integer(5));
        expected.insert("slot_content_id".to_string(), FieldValue::Integer(77));
        assert_eq!(
            task.decide(&unmarked),
            Directive::Insert {
                table: "slots".to_string(),
                values: expected
            }
        );

        let marked = Row::new(6).with_field("rev_content_id", 12_i64);
        assert_eq!(task.decide(&marked), Directive::Skip);
    }
}
