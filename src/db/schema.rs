//! Target table definition and the statements that write to it

use crate::staging::COLUMNS;

/// SQL data type of a benchmark column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    DoublePrecision,
    Text,
    Timestamp,
    Uuid,
}

impl SqlType {
    /// Returns the Postgres type name
    pub fn to_postgres(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::DoublePrecision => "DOUBLE PRECISION",
            SqlType::Text => "TEXT",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Uuid => "UUID",
        }
    }
}

/// A column in the target table
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
}

const fn column(name: &'static str, sql_type: SqlType, nullable: bool) -> Column {
    Column {
        name,
        sql_type,
        nullable,
    }
}

/// Target table columns, in the same order as [`COLUMNS`]
pub const TABLE_COLUMNS: [Column; 15] = [
    column("id", SqlType::Uuid, false),
    column("worker_id", SqlType::Integer, false),
    column("connection_id", SqlType::Integer, false),
    column("sequence_no", SqlType::BigInt, false),
    column("created_at", SqlType::Timestamp, false),
    column("customer_id", SqlType::Uuid, true),
    column("product_id", SqlType::Uuid, true),
    column("order_id", SqlType::Uuid, true),
    column("category", SqlType::Text, false),
    column("status", SqlType::Text, false),
    column("is_active", SqlType::Boolean, false),
    column("is_priority", SqlType::Boolean, false),
    column("amount", SqlType::DoublePrecision, false),
    column("description", SqlType::Text, false),
    column("payload", SqlType::Text, false),
];

/// Bind placeholder style of the target database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// Postgres style: `$1, $2, ...`
    Numbered,
    /// SQLite style: `?, ?, ...`
    #[cfg_attr(not(test), allow(dead_code))]
    Positional,
}

/// Quote a possibly schema-qualified table name (`schema.table`)
pub fn qualified_table_name(table: &str) -> String {
    table
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Comma-separated quoted column list in declared order
pub fn column_list() -> String {
    COLUMNS
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Header line of a staged artifact
pub fn header_line() -> String {
    COLUMNS.join(",")
}

/// Generate the DDL statement for the target table
pub fn create_table_sql(table: &str) -> String {
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n",
        qualified_table_name(table)
    );

    let column_defs: Vec<String> = TABLE_COLUMNS
        .iter()
        .map(|col| {
            let constraint = if col.name == "id" {
                " PRIMARY KEY"
            } else if col.nullable {
                ""
            } else {
                " NOT NULL"
            };
            format!("  \"{}\" {}{}", col.name, col.sql_type.to_postgres(), constraint)
        })
        .collect();

    ddl.push_str(&column_defs.join(",\n"));
    ddl.push_str("\n)");

    ddl
}

/// Server-side bulk-ingest command matching the staged artifact layout
pub fn copy_statement(table: &str) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true)",
        qualified_table_name(table),
        column_list()
    )
}

/// Multi-row INSERT for `rows` records
pub fn insert_statement(table: &str, rows: usize, placeholder: Placeholder) -> String {
    let width = COLUMNS.len();
    let value_groups: Vec<String> = (0..rows)
        .map(|row| {
            let placeholders: Vec<String> = (0..width)
                .map(|col| match placeholder {
                    Placeholder::Numbered => format!("${}", row * width + col + 1),
                    Placeholder::Positional => "?".to_string(),
                })
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified_table_name(table),
        column_list(),
        value_groups.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_columns_match_record_columns() {
        let names: Vec<&str> = TABLE_COLUMNS.iter().map(|c| c.name).collect();
        assert_eq!(names, COLUMNS);
    }

    #[test]
    fn test_qualified_table_name() {
        assert_eq!(qualified_table_name("bench"), "\"bench\"");
        assert_eq!(qualified_table_name("load.bench"), "\"load\".\"bench\"");
        assert_eq!(qualified_table_name("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_create_table_sql() {
        let ddl = create_table_sql("bench_records");

        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"bench_records\""));
        assert!(ddl.contains("\"id\" UUID PRIMARY KEY"));
        assert!(ddl.contains("\"customer_id\" UUID,"));
        assert!(ddl.contains("\"amount\" DOUBLE PRECISION NOT NULL"));
        assert!(ddl.contains("\"payload\" TEXT NOT NULL"));
    }

    #[test]
    fn test_copy_statement_lists_columns_in_order() {
        let sql = copy_statement("bench_records");

        assert!(sql.starts_with("COPY \"bench_records\" (\"id\", \"worker_id\""));
        assert!(sql.ends_with("FROM STDIN WITH (FORMAT csv, HEADER true)"));
    }

    #[test]
    fn test_insert_statement_placeholders() {
        let sql = insert_statement("t", 2, Placeholder::Numbered);
        assert!(sql.contains("($1, $2,"));
        assert!(sql.contains("$15), ($16,"));
        assert!(sql.ends_with("$30)"));

        let sql = insert_statement("t", 1, Placeholder::Positional);
        assert!(sql.ends_with(&format!("({})", vec!["?"; 15].join(", "))));
    }
}
