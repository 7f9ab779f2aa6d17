//! Relational dump codec.
//!
//! Output is a plain SQL script:
//!
//! ```text
//! -- docvault relational dump
//! CREATE TABLE IF NOT EXISTS "users" ("_id" TEXT PRIMARY KEY, "_updated_at" TIMESTAMP, ...);
//! BEGIN;
//! INSERT INTO "users" ("_id", "_updated_at", "name") VALUES ('u1', '2026-...Z', 'Ada');
//! COMMIT;
//! ```
//!
//! Column types are inferred from the union of fields and widened to the most
//! general type seen. Each INSERT lists only the fields its record actually
//! has, so a missing field and an explicit NULL stay distinguishable.

use std::collections::HashMap;

use chrono::Utc;
use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::{field_union, reject_reserved, Codec, ExportContext, FormatKind};
use crate::record::{
    format_timestamp, parse_timestamp, Document, Record, Value, ID_FIELD, UPDATED_AT_FIELD,
};
use crate::utils::errors::{Result, VaultError};

pub struct SqlCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    BigInt,
    Double,
    Boolean,
    Timestamp,
    Text,
    Json,
}

impl ColumnType {
    fn as_sql(self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Text => "TEXT",
            ColumnType::Json => "JSON",
        }
    }

    /// Type implied by a single value. Nulls imply nothing.
    fn of(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Int(_) => Some(ColumnType::BigInt),
            Value::Float(_) => Some(ColumnType::Double),
            Value::String(_) => Some(ColumnType::Text),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
            Value::Object(_) | Value::Array(_) => Some(ColumnType::Json),
        }
    }

    fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (BigInt, Double) | (Double, BigInt) => Double,
            _ => Text,
        }
    }

    fn from_sql(data_type: &sp::DataType) -> ColumnType {
        match data_type {
            sp::DataType::BigInt(_) => ColumnType::BigInt,
            sp::DataType::DoublePrecision => ColumnType::Double,
            sp::DataType::Boolean => ColumnType::Boolean,
            sp::DataType::Timestamp(..) => ColumnType::Timestamp,
            sp::DataType::JSON => ColumnType::Json,
            _ => ColumnType::Text,
        }
    }
}

impl Codec for SqlCodec {
    fn kind(&self) -> FormatKind {
        FormatKind::Sql
    }

    fn encode(&self, ctx: &ExportContext<'_>, records: &[Record]) -> Result<Vec<u8>> {
        let columns = infer_columns(records)?;
        let table = quote_ident(ctx.collection);
        let mut out = String::new();

        out.push_str("-- docvault relational dump\n");
        out.push_str(&format!("-- collection: {}\n", comment_safe(ctx.collection)));
        out.push_str(&format!("-- exported_at: {}\n", format_timestamp(&ctx.exported_at)));
        out.push_str(&format!("-- records: {}\n", records.len()));

        out.push_str(&format!("CREATE TABLE IF NOT EXISTS {} (\n", table));
        out.push_str(&format!("  {} TEXT PRIMARY KEY,\n", quote_ident(ID_FIELD)));
        out.push_str(&format!("  {} TIMESTAMP", quote_ident(UPDATED_AT_FIELD)));
        for (name, ty) in &columns {
            out.push_str(&format!(",\n  {} {}", quote_ident(name), ty.as_sql()));
        }
        out.push_str("\n);\n");

        out.push_str("BEGIN;\n");
        for record in records {
            let mut names = vec![quote_ident(ID_FIELD), quote_ident(UPDATED_AT_FIELD)];
            let mut values = vec![
                quote_str(&record.id),
                quote_str(&format_timestamp(&record.updated_at)),
            ];
            for (name, value) in record.fields.iter() {
                names.push(quote_ident(name));
                values.push(literal(value)?);
            }
            out.push_str(&format!(
                "INSERT INTO {} ({}) VALUES ({});\n",
                table,
                names.join(", "),
                values.join(", ")
            ));
        }
        out.push_str("COMMIT;\n");

        Ok(out.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| VaultError::corrupt(format!("relational dump is not UTF-8: {}", e)))?;
        let statements = Parser::parse_sql(&GenericDialect {}, text)
            .map_err(|e| VaultError::corrupt(format!("unparsable relational dump: {}", e)))?;

        let mut column_types: HashMap<String, ColumnType> = HashMap::new();
        let mut records = Vec::new();

        for statement in statements {
            match statement {
                sp::Statement::CreateTable(create) => column_types = schema_of(&create),
                sp::Statement::Insert(insert) => {
                    records.extend(insert_records(insert, &column_types)?);
                }
                sp::Statement::StartTransaction { .. } | sp::Statement::Commit { .. } => {}
                other => {
                    let text = other.to_string();
                    let head: String = text.chars().take(60).collect();
                    return Err(VaultError::format(
                        "sql",
                        format!("unexpected statement in relational dump: {}", head),
                    ));
                }
            }
        }

        Ok(records)
    }
}

fn infer_columns(records: &[Record]) -> Result<Vec<(String, ColumnType)>> {
    let names = field_union(records);
    let mut types: HashMap<&str, Option<ColumnType>> = HashMap::new();

    for record in records {
        reject_reserved(FormatKind::Sql, record)?;
        for (name, value) in record.fields.iter() {
            let seen = ColumnType::of(value);
            let slot = types.entry(name).or_insert(None);
            *slot = match (*slot, seen) {
                (Some(a), Some(b)) => Some(a.widen(b)),
                (a, b) => a.or(b),
            };
        }
    }

    Ok(names
        .into_iter()
        .map(|name| {
            let ty = types
                .get(name.as_str())
                .copied()
                .flatten()
                .unwrap_or(ColumnType::Text);
            (name, ty)
        })
        .collect())
}

fn literal(value: &Value) -> Result<String> {
    ensure_finite(value)?;
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Int(i) => i.to_string(),
        // Debug formatting always keeps a '.' or an exponent, which is how
        // the decoder tells floats from integers.
        Value::Float(f) => format!("{:?}", f),
        Value::String(s) => quote_str(s),
        Value::Timestamp(ts) => quote_str(&format_timestamp(ts)),
        Value::Object(_) | Value::Array(_) => quote_str(&value.to_json().to_string()),
    })
}

fn ensure_finite(value: &Value) -> Result<()> {
    match value {
        Value::Float(f) if !f.is_finite() => Err(VaultError::format(
            "sql",
            format!("{} has no SQL literal", f),
        )),
        Value::Object(doc) => doc.iter().try_for_each(|(_, v)| ensure_finite(v)),
        Value::Array(items) => items.iter().try_for_each(ensure_finite),
        _ => Ok(()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn comment_safe(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

fn schema_of(create: &sp::CreateTable) -> HashMap<String, ColumnType> {
    create
        .columns
        .iter()
        .map(|column| (column.name.value.clone(), ColumnType::from_sql(&column.data_type)))
        .collect()
}

fn insert_records(insert: sp::Insert, column_types: &HashMap<String, ColumnType>) -> Result<Vec<Record>> {
    let names: Vec<String> = insert.columns.into_iter().map(|c| c.value).collect();
    let rows = match insert.source.map(|query| *query.body) {
        Some(sp::SetExpr::Values(values)) => values.rows,
        _ => return Err(VaultError::format("sql", "INSERT without a VALUES list")),
    };
    rows.into_iter()
        .map(|row| record_from_row(&names, row, column_types))
        .collect()
}

fn record_from_row(
    names: &[String],
    row: Vec<sp::Expr>,
    column_types: &HashMap<String, ColumnType>,
) -> Result<Record> {
    if names.len() != row.len() {
        return Err(VaultError::corrupt(format!(
            "INSERT lists {} columns but {} values",
            names.len(),
            row.len()
        )));
    }

    let mut id = None;
    let mut updated_at = None;
    let mut fields = Document::new();

    for (name, expr) in names.iter().zip(row) {
        let ty = column_types.get(name).copied().unwrap_or(ColumnType::Text);
        let value = parse_literal(expr, ty)?;

        match name.as_str() {
            ID_FIELD => {
                id = Some(match value {
                    Value::String(s) => s,
                    other => other.display_text(),
                })
            }
            UPDATED_AT_FIELD => {
                updated_at = match value {
                    Value::Timestamp(ts) => Some(ts),
                    Value::String(s) => parse_timestamp(&s),
                    _ => None,
                }
            }
            _ => {
                fields.insert(name.clone(), value);
            }
        }
    }

    let id = id.ok_or_else(|| VaultError::corrupt("INSERT without an '_id' column"))?;
    let mut record = Record::new(id, updated_at.unwrap_or_else(Utc::now));
    record.fields = fields;
    Ok(record)
}

fn parse_literal(expr: sp::Expr, ty: ColumnType) -> Result<Value> {
    match expr {
        sp::Expr::Value(value) => match value.value {
            sp::Value::Null => Ok(Value::Null),
            sp::Value::Boolean(b) => Ok(Value::Bool(b)),
            sp::Value::Number(n, _) => parse_number(&n),
            sp::Value::SingleQuotedString(s) => Ok(match ty {
                ColumnType::Timestamp => parse_timestamp(&s)
                    .map(Value::Timestamp)
                    .unwrap_or(Value::String(s)),
                ColumnType::Json => match serde_json::from_str::<serde_json::Value>(&s) {
                    Ok(json) => Value::from_json(&json),
                    Err(_) => Value::String(s),
                },
                _ => Value::String(s),
            }),
            other => Err(VaultError::format(
                "sql",
                format!("unsupported literal {}", other),
            )),
        },
        sp::Expr::UnaryOp {
            op: sp::UnaryOperator::Minus,
            expr,
        } => match *expr {
            sp::Expr::Value(sp::ValueWithSpan {
                value: sp::Value::Number(n, _),
                ..
            }) => parse_number(&format!("-{}", n)),
            other => Err(VaultError::format(
                "sql",
                format!("unsupported negated value {}", other),
            )),
        },
        other => Err(VaultError::format(
            "sql",
            format!("unsupported value expression {}", other),
        )),
    }
}

fn parse_number(n: &str) -> Result<Value> {
    if n.contains(['.', 'e', 'E']) {
        n.parse::<f64>()
            .map(Value::Float)
            .map_err(|_| VaultError::corrupt(format!("bad float literal '{}'", n)))
    } else {
        n.parse::<i64>()
            .map(Value::Int)
            .map_err(|_| VaultError::corrupt(format!("bad integer literal '{}'", n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    fn ts(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, sec).unwrap()
    }

    fn ctx() -> ExportContext<'static> {
        ExportContext {
            collection: "users",
            exported_at: ts(0),
        }
    }

    #[test]
    fn test_round_trip_preserves_scalars_and_nested() {
        let mut address = Document::new();
        address.insert("city", "Oslo");
        address.insert("since", ts(9));

        let records = vec![
            Record::new("u1", ts(1))
                .with_field("name", "O'Brien")
                .with_field("age", 42i64)
                .with_field("score", 1.0)
                .with_field("active", true)
                .with_field("address", Value::Object(address)),
            Record::new("u2", ts(2))
                .with_field("name", "Line\nBreak")
                .with_field("tags", Value::Array(vec!["a".into(), "b".into()]))
                .with_field("nickname", Value::Null),
        ];

        let bytes = SqlCodec.encode(&ctx(), &records).unwrap();
        let decoded = SqlCodec.decode(&bytes).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_schema_widens_conflicting_types() {
        let records = vec![
            Record::new("a", ts(1))
                .with_field("n", 1i64)
                .with_field("mixed", 5i64),
            Record::new("b", ts(2))
                .with_field("n", 2.5)
                .with_field("mixed", "five"),
        ];
        let text = String::from_utf8(SqlCodec.encode(&ctx(), &records).unwrap()).unwrap();
        assert!(text.contains("\"n\" DOUBLE PRECISION"));
        assert!(text.contains("\"mixed\" TEXT"));

        // Widening keeps the literal's own type on the way back.
        let decoded = SqlCodec.decode(text.as_bytes()).unwrap();
        assert_eq!(decoded[0].fields.get("mixed"), Some(&Value::Int(5)));
        assert_eq!(decoded[1].fields.get("n"), Some(&Value::Float(2.5)));
    }

    #[test]
    fn test_widened_timestamp_column_decodes_as_text() {
        let records = vec![
            Record::new("a", ts(1)).with_field("when", ts(3)),
            Record::new("b", ts(2)).with_field("when", "yesterday"),
        ];
        let bytes = SqlCodec.encode(&ctx(), &records).unwrap();
        let decoded = SqlCodec.decode(&bytes).unwrap();
        assert_eq!(
            decoded[0].fields.get("when"),
            Some(&Value::String("2026-05-01T12:00:03.000Z".into()))
        );
    }

    #[test]
    fn test_empty_collection_produces_valid_script() {
        let bytes = SqlCodec.encode(&ctx(), &[]).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("CREATE TABLE IF NOT EXISTS \"users\""));
        assert!(SqlCodec.decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_non_finite_float_is_format_error() {
        let records = vec![Record::new("a", ts(1)).with_field("x", f64::NAN)];
        let err = SqlCodec.encode(&ctx(), &records).unwrap_err();
        assert!(matches!(err, VaultError::Format { .. }));
    }

    #[test]
    fn test_reserved_field_is_format_error() {
        let records = vec![Record::new("a", ts(1)).with_field("_id", "shadow")];
        assert!(matches!(
            SqlCodec.encode(&ctx(), &records),
            Err(VaultError::Format { .. })
        ));
    }

    #[test]
    fn test_negative_and_extreme_numbers() {
        let records = vec![Record::new("n", ts(1))
            .with_field("min", i64::MIN)
            .with_field("neg", -2.5e-7)
            .with_field("big", 1e300)];
        let bytes = SqlCodec.encode(&ctx(), &records).unwrap();
        assert_eq!(SqlCodec.decode(&bytes).unwrap(), records);
    }

    #[test]
    fn test_foreign_statement_is_format_error() {
        let script = b"CREATE TABLE \"t\" (\"_id\" TEXT PRIMARY KEY);\nDROP TABLE \"t\";";
        assert!(matches!(
            SqlCodec.decode(script),
            Err(VaultError::Format { .. })
        ));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = SqlCodec.decode(b"INSERT INTO \"t\" (\"_id\") VALUES ('a'").unwrap_err();
        assert!(matches!(err, VaultError::CorruptArchive(_)));
        let err = SqlCodec.decode(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, VaultError::CorruptArchive(_)));
    }
}
