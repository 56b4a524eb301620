use crate::database::Database;
use crate::error::SyncError;
use crate::models::SourcedRecord;
use crate::source::{record_from_object, RecordSource};
use async_trait::async_trait;
use log::warn;
use serde_json::Value;

/// Pages through a Postgres table ordered by its key column.
pub struct TableSource {
    db: Database,
    table: String,
    key_column: String,
    page_size: usize,
    position: u64,
    exhausted: bool,
}

impl TableSource {
    pub fn new(
        db: Database,
        table: &str,
        key_column: &str,
        page_size: usize,
    ) -> Result<Self, SyncError> {
        quote_identifier(table)?;
        quote_identifier(key_column)?;
        Ok(Self {
            db,
            table: table.to_string(),
            key_column: key_column.to_string(),
            page_size: page_size.max(1),
            position: 0,
            exhausted: false,
        })
    }

    pub fn starting_at(mut self, offset: u64) -> Self {
        self.position = offset;
        self
    }

    fn page_sql(&self) -> Result<String, SyncError> {
        Ok(format!(
            "SELECT row_to_json(t)::jsonb FROM {} t ORDER BY t.{} LIMIT $1 OFFSET $2",
            quote_identifier(&self.table)?,
            quote_identifier(&self.key_column)?
        ))
    }
}

#[async_trait]
impl RecordSource for TableSource {
    fn describe(&self) -> String {
        format!("table {} keyed by {}", self.table, self.key_column)
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<SourcedRecord>>, SyncError> {
        if self.exhausted {
            return Ok(None);
        }

        let sql = self.page_sql()?;
        let limit = self.page_size as i64;
        let offset = self.position as i64;
        let rows = self
            .db
            .client()
            .query(sql.as_str(), &[&limit, &offset])
            .await
            .map_err(|err| {
                SyncError::SourceUnavailable(format!("query on {} failed: {}", self.table, err))
            })?;

        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }

        let mut chunk = Vec::with_capacity(rows.len());
        for row in rows {
            let offset = self.position;
            self.position += 1;
            let Value::Object(object) = row.get::<_, Value>(0) else {
                continue;
            };
            match record_from_object(object, &self.key_column) {
                Some(record) => chunk.push(SourcedRecord { offset, record }),
                None => warn!(
                    "Row {} of {} has no usable {}",
                    offset, self.table, self.key_column
                ),
            }
        }
        Ok(Some(chunk))
    }
}

/// Quotes a (optionally schema-qualified) identifier made of `[A-Za-z0-9_]`.
pub fn quote_identifier(name: &str) -> Result<String, SyncError> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(SyncError::Config(format!("invalid identifier '{}'", name)));
    }
    let mut quoted = Vec::with_capacity(parts.len());
    for part in parts {
        let valid = !part.is_empty()
            && !part.starts_with(|c: char| c.is_ascii_digit())
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(SyncError::Config(format!("invalid identifier '{}'", name)));
        }
        quoted.push(format!("\"{}\"", part));
    }
    Ok(quoted.join("."))
}

#[cfg(test)]
mod tests {
    use super::quote_identifier;

    #[test]
    fn identifiers_are_quoted_per_part() {
        assert_eq!(quote_identifier("etfs").expect("valid"), "\"etfs\"");
        assert_eq!(
            quote_identifier("public.etf_prices").expect("valid"),
            "\"public\".\"etf_prices\""
        );
    }

    #[test]
    fn injection_attempts_are_rejected() {
        for name in ["etfs; DROP TABLE x", "a.b.c", "", "1abc", "name\"x"] {
            assert!(quote_identifier(name).is_err(), "{} should fail", name);
        }
    }
}
