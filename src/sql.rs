use std::collections::{BTreeSet, HashMap};

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        phone: String,
    },
    InsertBarber {
        id: Ulid,
        phone: String,
    },
    InsertService {
        service: ServiceInfo,
    },
    DeleteService {
        id: Ulid,
    },
    InsertTemplate {
        barber_id: Ulid,
        day_of_week: u8,
        hours: WorkingHours,
    },
    InsertOverride {
        barber_id: Ulid,
        date: NaiveDate,
        hours: Option<WorkingHours>,
        closed_slots: BTreeSet<NaiveTime>,
        fully_closed: bool,
    },
    DeleteOverride {
        barber_id: Ulid,
        date: NaiveDate,
    },
    InsertClosedSlots {
        barber_id: Ulid,
        date: NaiveDate,
        slots: Vec<NaiveTime>,
    },
    /// `slot: None` clears every closed slot on the date.
    DeleteClosedSlots {
        barber_id: Ulid,
        date: NaiveDate,
        slot: Option<NaiveTime>,
    },
    InsertDateStatus {
        barber_id: Ulid,
        date: NaiveDate,
        open: bool,
    },
    InsertBooking {
        id: Ulid,
        barber_id: Ulid,
        user_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectAvailability {
        barber_id: Ulid,
        date: NaiveDate,
        service_id: Option<Ulid>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectTemplates {
        barber_id: Ulid,
    },
    SelectOverride {
        barber_id: Ulid,
        date: NaiveDate,
    },
    SelectServices {
        barber_id: Ulid,
    },
    SelectUser {
        phone: String,
    },
}

#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    Barber { barber_id: Ulid, date: NaiveDate },
    User { user_id: Ulid },
    Id { id: Ulid },
}

/// Parse the first statement of `sql`.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = parse_statements(sql)?;
    parse_statement(&stmts[0])
}

/// Parse every `;`-separated statement of a simple-query string, in order.
pub fn parse_script(sql: &str) -> Result<Vec<Command>, SqlError> {
    parse_statements(sql)?.iter().map(parse_statement).collect()
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts)
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table named by a SELECT's FROM clause. Works on statements that still
/// carry `$N` placeholders, so result schemas can be described before binding.
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
    let rows = extract_all_insert_rows(insert)?;
    let values = &rows[0];

    match table.as_str() {
        "users" | "barbers" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("users/barbers", 2, values.len()));
            }
            let id = parse_ulid(&values[0])?;
            let phone = parse_string(&values[1])?;
            Ok(if table == "users" {
                Command::InsertUser { id, phone }
            } else {
                Command::InsertBarber { id, phone }
            })
        }
        "services" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("services", 5, values.len()));
            }
            let active = match values.get(5) {
                Some(v) => parse_bool(v)?,
                None => true,
            };
            Ok(Command::InsertService {
                service: ServiceInfo {
                    id: parse_ulid(&values[0])?,
                    barber_id: parse_ulid(&values[1])?,
                    name: parse_string(&values[2])?,
                    duration_slots: parse_u32(&values[3])?,
                    price_cents: parse_u32(&values[4])?,
                    active,
                },
            })
        }
        "templates" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("templates", 7, values.len()));
            }
            let day = parse_i64(&values[1])?;
            let day_of_week =
                u8::try_from(day).map_err(|_| SqlError::Parse(format!("{day} out of day_of_week range")))?;
            Ok(Command::InsertTemplate {
                barber_id: parse_ulid(&values[0])?,
                day_of_week,
                hours: parse_working_hours(&values[2..7])?,
            })
        }
        "overrides" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("overrides", 7, values.len()));
            }
            let hours = if values[2..7].iter().all(is_null) {
                None
            } else {
                Some(parse_working_hours(&values[2..7])?)
            };
            let fully_closed = match values.get(7) {
                Some(v) if !is_null(v) => parse_bool(v)?,
                _ => false,
            };
            let closed_slots = match values.get(8) {
                Some(v) if !is_null(v) => parse_time_list(v)?,
                _ => BTreeSet::new(),
            };
            Ok(Command::InsertOverride {
                barber_id: parse_ulid(&values[0])?,
                date: parse_date(&values[1])?,
                hours,
                closed_slots,
                fully_closed,
            })
        }
        "closed_slots" => {
            // Every row must name the same barber and date.
            let mut target = None;
            let mut slots = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 3 {
                    return Err(SqlError::WrongArity("closed_slots row", 3, row.len()));
                }
                let key = (parse_ulid(&row[0])?, parse_date(&row[1])?);
                match target {
                    None => target = Some(key),
                    Some(t) if t != key => {
                        return Err(SqlError::Parse(format!("row {i}: all rows must share barber_id and date")));
                    }
                    Some(_) => {}
                }
                slots.push(parse_time(&row[2]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?);
            }
            let (barber_id, date) = target.ok_or(SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::InsertClosedSlots { barber_id, date, slots })
        }
        "date_status" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("date_status", 3, values.len()));
            }
            Ok(Command::InsertDateStatus {
                barber_id: parse_ulid(&values[0])?,
                date: parse_date(&values[1])?,
                open: parse_bool(&values[2])?,
            })
        }
        "bookings" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("bookings", 6, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                barber_id: parse_ulid(&values[1])?,
                user_id: parse_ulid(&values[2])?,
                service_id: parse_ulid(&values[3])?,
                date: parse_date(&values[4])?,
                start: parse_time(&values[5])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `am_start, am_end, pm_start, pm_end, interval_minutes`.
fn parse_working_hours(values: &[Expr]) -> Result<WorkingHours, SqlError> {
    Ok(WorkingHours::new(
        Window::new(parse_time(&values[0])?, parse_time(&values[1])?),
        Window::new(parse_time(&values[2])?, parse_time(&values[3])?),
        parse_u32(&values[4])?,
    ))
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = extract_where_eq(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: parse_ulid(require(&filters, "id")?)?,
        }),
        "services" => Ok(Command::DeleteService {
            id: parse_ulid(require(&filters, "id")?)?,
        }),
        "overrides" => Ok(Command::DeleteOverride {
            barber_id: parse_ulid(require(&filters, "barber_id")?)?,
            date: parse_date(require(&filters, "date")?)?,
        }),
        "closed_slots" => Ok(Command::DeleteClosedSlots {
            barber_id: parse_ulid(require(&filters, "barber_id")?)?,
            date: parse_date(require(&filters, "date")?)?,
            slot: filters.get("slot").map(|e| parse_time(e)).transpose()?,
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
    let filters = extract_where_eq(&select.selection)?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            barber_id: parse_ulid(require(&filters, "barber_id")?)?,
            date: parse_date(require(&filters, "date")?)?,
            service_id: filters.get("service_id").map(|e| parse_ulid(e)).transpose()?,
        }),
        "bookings" => {
            let filter = if let Some(id) = filters.get("id") {
                BookingFilter::Id { id: parse_ulid(id)? }
            } else if let Some(user_id) = filters.get("user_id") {
                BookingFilter::User {
                    user_id: parse_ulid(user_id)?,
                }
            } else {
                BookingFilter::Barber {
                    barber_id: parse_ulid(require(&filters, "barber_id")?)?,
                    date: parse_date(require(&filters, "date")?)?,
                }
            };
            Ok(Command::SelectBookings { filter })
        }
        "templates" => Ok(Command::SelectTemplates {
            barber_id: parse_ulid(require(&filters, "barber_id")?)?,
        }),
        "overrides" => Ok(Command::SelectOverride {
            barber_id: parse_ulid(require(&filters, "barber_id")?)?,
            date: parse_date(require(&filters, "date")?)?,
        }),
        "services" => Ok(Command::SelectServices {
            barber_id: parse_ulid(require(&filters, "barber_id")?)?,
        }),
        "users" => Ok(Command::SelectUser {
            phone: parse_string(require(&filters, "phone")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
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

/// Collect `column = value` terms joined by AND. Other predicates are rejected.
fn extract_where_eq(selection: &Option<Expr>) -> Result<HashMap<String, Expr>, SqlError> {
    fn walk(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(col, right.as_ref().clone());
                Ok(())
            }
            Expr::Nested(inner) => walk(inner, out),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = HashMap::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

fn require<'a>(filters: &'a HashMap<String, Expr>, col: &'static str) -> Result<&'a Expr, SqlError> {
    filters.get(col).ok_or(SqlError::MissingFilter(col))
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_time_str(s: &str) -> Result<NaiveTime, SqlError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time '{s}': {e}")))
}

/// `'HH:MM'` (seconds accepted).
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    parse_time_str(&parse_string(expr)?)
}

/// `'HH:MM,HH:MM,...'`; an empty string is an empty set.
fn parse_time_list(expr: &Expr) -> Result<BTreeSet<NaiveTime>, SqlError> {
    let s = parse_string(expr)?;
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(parse_time_str)
        .collect()
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
