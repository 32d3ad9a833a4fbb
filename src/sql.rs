use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// How long the slots in a `slots` query are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLength {
    Minutes(u32),
    Service(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    All,
    Id(Ulid),
    Status(BookingStatus),
    Date(NaiveDate),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertService {
        id: Ulid,
        title: String,
        duration_minutes: u32,
        price: i64,
        is_active: bool,
        description: Option<String>,
        category_id: Option<Ulid>,
    },
    DeleteService {
        id: Ulid,
    },
    UpsertMaster {
        id: Ulid,
        name: String,
        bio: Option<String>,
        experience_years: u8,
        is_active: bool,
        /// Absent keeps the stored rating.
        rating: Option<f64>,
    },
    DeleteMaster {
        id: Ulid,
    },
    LinkMasterService {
        master_id: Ulid,
        service_id: Ulid,
    },
    UnlinkMasterService {
        master_id: Ulid,
        service_id: Ulid,
    },
    /// The rows of one INSERT are the whole new week.
    ReplaceSchedule {
        master_id: Ulid,
        entries: Vec<ScheduleEntry>,
    },
    ClearSchedule {
        master_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        service_id: Ulid,
        master_id: Option<Ulid>,
        date: NaiveDate,
        time: TimeOfDay,
    },
    InsertStatusChange {
        booking_id: Ulid,
        status: BookingStatus,
        comment: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectAvailability {
        master_id: Ulid,
        date: NaiveDate,
        time: TimeOfDay,
    },
    SelectSlots {
        master_id: Ulid,
        date: NaiveDate,
        length: SlotLength,
    },
    SelectSchedule {
        master_id: Ulid,
    },
    SelectServices,
    SelectMasters {
        service_id: Option<Ulid>,
    },
    SelectMasterServices {
        master_id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectStatusChanges {
        booking_id: Ulid,
    },
    SelectBookingStats {
        user_id: Option<Ulid>,
    },
    SelectAdminStats,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table read by a SELECT, without looking at its filters. Lets the extended
/// protocol describe a statement whose parameters aren't bound yet.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, columns) = insert_columns(&table).ok_or(SqlError::UnknownTable(table))?;
    let rows = extract_insert_rows(insert)?;
    if table != "schedules" && rows.len() > 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let row = InsertRow::map(table, columns, &insert.columns, &rows[0])?;

    match table {
        "services" => Ok(Command::UpsertService {
            id: row.required("id", parse_ulid)?,
            title: row.required("title", parse_string)?,
            duration_minutes: row.required("duration", parse_u32)?,
            price: row.required("price", parse_i64)?,
            is_active: row.optional("is_active", parse_bool)?.unwrap_or(true),
            description: row.optional("description", parse_string)?,
            category_id: row.optional("category_id", parse_ulid)?,
        }),
        "masters" => Ok(Command::UpsertMaster {
            id: row.required("id", parse_ulid)?,
            name: row.required("name", parse_string)?,
            bio: row.optional("bio", parse_string)?,
            experience_years: row.optional("experience_years", parse_u8)?.unwrap_or(0),
            is_active: row.optional("is_active", parse_bool)?.unwrap_or(true),
            rating: row.optional("rating", parse_f64)?,
        }),
        "master_services" => Ok(Command::LinkMasterService {
            master_id: row.required("master_id", parse_ulid)?,
            service_id: row.required("service_id", parse_ulid)?,
        }),
        "schedules" => {
            let mut master_id = None;
            let mut entries = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let row = InsertRow::map(table, columns, &insert.columns, values)?;
                let row_master = row.required("master_id", parse_ulid)?;
                if *master_id.get_or_insert(row_master) != row_master {
                    return Err(SqlError::Parse(format!(
                        "row {i}: all schedule rows must belong to one master"
                    )));
                }
                entries.push(ScheduleEntry {
                    day_of_week: row.required("day_of_week", parse_u8)?,
                    start: row.required("start_time", parse_time)?,
                    end: row.required("end_time", parse_time)?,
                    is_available: row.optional("is_available", parse_bool)?.unwrap_or(true),
                });
            }
            Ok(Command::ReplaceSchedule {
                master_id: master_id.ok_or(SqlError::Parse("empty VALUES".into()))?,
                entries,
            })
        }
        "bookings" => Ok(Command::InsertBooking {
            id: row.required("id", parse_ulid)?,
            service_id: row.required("service_id", parse_ulid)?,
            master_id: row.optional("master_id", parse_ulid)?,
            date: row.required("date", parse_date)?,
            time: row.required("time", parse_time)?,
        }),
        "status_changes" => Ok(Command::InsertStatusChange {
            booking_id: row.required("booking_id", parse_ulid)?,
            status: row.required("status", parse_status)?,
            comment: row.optional("comment", parse_string)?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

/// Writable columns per table, in the order a bare `VALUES` list binds them.
fn insert_columns(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    Some(match table {
        "services" => (
            "services",
            &["id", "title", "duration", "price", "is_active", "description", "category_id"],
        ),
        "masters" => (
            "masters",
            &["id", "name", "bio", "experience_years", "is_active", "rating"],
        ),
        "master_services" => ("master_services", &["master_id", "service_id"]),
        "schedules" => (
            "schedules",
            &["master_id", "day_of_week", "start_time", "end_time", "is_available"],
        ),
        "bookings" => ("bookings", &["id", "service_id", "master_id", "date", "time"]),
        "status_changes" => ("status_changes", &["booking_id", "status", "comment"]),
        _ => return None,
    })
}

/// One `VALUES` row keyed by column name.
struct InsertRow<'a> {
    table: &'static str,
    values: HashMap<&'static str, &'a Expr>,
}

impl<'a> InsertRow<'a> {
    /// Pair values with the statement's column list, or with `columns` in order
    /// when the statement names none.
    fn map(
        table: &'static str,
        columns: &'static [&'static str],
        named: &[ast::Ident],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let order: Vec<&'static str> = if named.is_empty() {
            if values.len() > columns.len() {
                return Err(SqlError::Parse(format!(
                    "{table} takes at most {} values, got {}",
                    columns.len(),
                    values.len()
                )));
            }
            columns[..values.len()].to_vec()
        } else {
            if named.len() != values.len() {
                return Err(SqlError::Parse(format!(
                    "{} columns but {} values",
                    named.len(),
                    values.len()
                )));
            }
            named
                .iter()
                .map(|ident| {
                    let name = ident.value.to_lowercase();
                    columns
                        .iter()
                        .copied()
                        .find(|c| *c == name)
                        .ok_or_else(|| SqlError::Unsupported(format!("column {name} of {table}")))
                })
                .collect::<Result<_, _>>()?
        };

        let mut map = HashMap::with_capacity(order.len());
        for (column, expr) in order.into_iter().zip(values) {
            if map.insert(column, expr).is_some() {
                return Err(SqlError::Parse(format!("column {column} given twice")));
            }
        }
        Ok(Self { table, values: map })
    }

    fn required<T>(
        &self,
        column: &'static str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<T, SqlError> {
        let expr = self
            .values
            .get(column)
            .copied()
            .ok_or(SqlError::MissingColumn(self.table, column))?;
        parse(expr)
    }

    fn optional<T>(
        &self,
        column: &'static str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        optional(self.values.get(column).copied(), parse)
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService {
            id: filters.required("id", parse_ulid)?,
        }),
        "masters" => Ok(Command::DeleteMaster {
            id: filters.required("id", parse_ulid)?,
        }),
        "master_services" => Ok(Command::UnlinkMasterService {
            master_id: filters.required("master_id", parse_ulid)?,
            service_id: filters.required("service_id", parse_ulid)?,
        }),
        "schedules" => Ok(Command::ClearSchedule {
            master_id: filters.required("master_id", parse_ulid)?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: filters.required("id", parse_ulid)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            master_id: filters.required("master_id", parse_ulid)?,
            date: filters.required("date", parse_date)?,
            time: filters.required("time", parse_time)?,
        }),
        "slots" => {
            let length = match (
                filters.optional("duration", parse_u32)?,
                filters.optional("service_id", parse_ulid)?,
            ) {
                (Some(minutes), None) => SlotLength::Minutes(minutes),
                (None, Some(service_id)) => SlotLength::Service(service_id),
                (None, None) => return Err(SqlError::MissingFilter("duration or service_id")),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Parse("give either duration or service_id, not both".into()));
                }
            };
            Ok(Command::SelectSlots {
                master_id: filters.required("master_id", parse_ulid)?,
                date: filters.required("date", parse_date)?,
                length,
            })
        }
        "schedules" => Ok(Command::SelectSchedule {
            master_id: filters.required("master_id", parse_ulid)?,
        }),
        "services" => Ok(Command::SelectServices),
        "masters" => Ok(Command::SelectMasters {
            service_id: filters.optional("service_id", parse_ulid)?,
        }),
        "master_services" => Ok(Command::SelectMasterServices {
            master_id: filters.required("master_id", parse_ulid)?,
        }),
        "bookings" => {
            let filter = if let Some(id) = filters.optional("id", parse_ulid)? {
                BookingFilter::Id(id)
            } else if let Some(status) = filters.optional("status", parse_status)? {
                BookingFilter::Status(status)
            } else if let Some(date) = filters.optional("date", parse_date)? {
                BookingFilter::Date(date)
            } else {
                BookingFilter::All
            };
            Ok(Command::SelectBookings { filter })
        }
        "status_changes" => Ok(Command::SelectStatusChanges {
            booking_id: filters.required("booking_id", parse_ulid)?,
        }),
        "booking_stats" => Ok(Command::SelectBookingStats {
            user_id: filters.optional("user_id", parse_ulid)?,
        }),
        "admin_stats" => Ok(Command::SelectAdminStats),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// `col = value` terms of a WHERE clause joined by AND, keyed by column.
struct Filters(HashMap<String, Expr>);

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut terms = HashMap::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self(terms))
    }

    fn optional<T>(
        &self,
        col: &'static str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        self.0.get(col).map(parse).transpose()
    }

    fn required<T>(
        &self,
        col: &'static str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<T, SqlError> {
        self.optional(col, parse)?.ok_or(SqlError::MissingFilter(col))
    }
}

fn collect_terms(expr: &Expr, terms: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, terms),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_terms(left, terms)?;
            collect_terms(right, terms)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            if terms.insert(col.clone(), right.as_ref().clone()).is_some() {
                return Err(SqlError::Parse(format!("column {col} filtered twice")));
            }
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!(
            "WHERE supports only col = value joined by AND, got {other}"
        ))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Absent or NULL both mean `None`.
fn optional<T>(
    expr: Option<&Expr>,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match expr {
        None => Ok(None),
        Some(e) if is_null(e) => Ok(None),
        Some(e) => parse(e).map(Some),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_f64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    crate::engine::parse_date(&s).map_err(|_| SqlError::BadLiteral(format!("date {s:?}, expected YYYY-MM-DD")))
}

fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = parse_string(expr)?;
    TimeOfDay::parse(&s).ok_or_else(|| SqlError::BadLiteral(format!("time {s:?}, expected HH:MM")))
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string(expr)?;
    BookingStatus::parse(&s).ok_or_else(|| SqlError::BadLiteral(format!("status {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: column {1} is required")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid literal: {0}")]
    BadLiteral(String),
}
