use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::Deserialize;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::NewCredit;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectTenant,
    UpdateSettings {
        display_name: Option<String>,
        slot_minutes: u32,
        lead_minutes: u32,
    },
    SetWeeklyHours {
        professional_id: Option<Ulid>,
        hours: WeeklyHours,
    },
    SelectWeeklyHours {
        professional_id: Option<Ulid>,
    },
    SetLunchBreak {
        lunch: LunchBreak,
    },
    SelectLunchBreak,
    UpsertSpecialDay {
        day: SpecialDay,
    },
    DeleteSpecialDay {
        id: Ulid,
    },
    SelectSpecialDays,
    SaveOffering {
        offering: Offering,
    },
    DeleteOffering {
        id: Ulid,
    },
    SelectOfferings {
        professional_id: Option<Ulid>,
    },
    SaveProfessional {
        professional: Professional,
    },
    DeleteProfessional {
        id: Ulid,
    },
    SelectProfessionals {
        agenda_only: bool,
    },
    SelectSlots {
        date: NaiveDate,
        lines: Vec<LineItem>,
        professional_id: Option<Ulid>,
    },
    InsertAppointment {
        appointment: NewAppointment,
    },
    SelectAppointments {
        date: NaiveDate,
        professional_id: Option<Ulid>,
    },
    CompleteAppointment {
        id: Ulid,
        payment_method: PaymentMethod,
        lines: Option<Vec<LineItem>>,
    },
    CancelAppointment {
        id: Ulid,
    },
    RescheduleAppointment {
        id: Ulid,
        start: Ms,
    },
    DeleteAppointment {
        id: Ulid,
    },
    InsertCredit {
        credit: NewCredit,
    },
    DeleteCredit {
        id: Ulid,
    },
    SelectCredits {
        pending_only: bool,
    },
    InsertCreditPayment {
        id: Ulid,
        credit_id: Ulid,
        amount_cents: Cents,
        method: Option<String>,
    },
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

/// Table whose rows a statement returns, if any. Works on statements that
/// still carry `$n` placeholders, for describing prepared statements.
pub fn result_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        Statement::Insert(insert) => insert_table_name(insert).ok().filter(|t| t == "completions"),
        _ => None,
    }
}

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "settings" => &["name", "slot_minutes", "lead_minutes"],
        "weekly_hours" => &["day", "start", "end", "day_off", "professional_id"],
        "lunch_break" => &["active", "start", "end"],
        "special_days" => &["id", "date", "day_off", "start", "end"],
        "offerings" => &["id", "name", "minutes", "price"],
        "professionals" => &["id", "name", "login", "show_in_agenda", "excluded"],
        "appointments" => &[
            "id",
            "client_name",
            "phone",
            "start",
            "offering_ids",
            "professional_id",
            "quantity",
            "pets",
        ],
        "completions" => &["appointment_id", "payment_method", "offering_ids", "quantity"],
        "cancellations" => &["appointment_id"],
        "reschedules" => &["appointment_id", "start"],
        "credits" => &["id", "client_name", "amount", "phone", "description"],
        "credit_payments" => &["id", "credit_id", "amount", "method"],
        _ => &[],
    }
}

/// One VALUES row addressed by column name.
struct Row<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn new(table: &str, columns: &[ast::Ident], values: &'a [Expr]) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            default_columns(table).iter().map(|c| c.to_string()).collect()
        } else {
            columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > names.len() {
            return Err(SqlError::WrongArity(names.len(), values.len()));
        }
        Ok(Row {
            values: names.into_iter().zip(values.iter()).collect(),
        })
    }

    /// The expression for `col`, treating a literal NULL as absent.
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.values
            .get(col)
            .copied()
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let row = Row::new(&table, &insert.columns, &values)?;

    match table.as_str() {
        "settings" => Ok(Command::UpdateSettings {
            display_name: row.get("name").map(parse_string).transpose()?,
            slot_minutes: parse_u32(row.require("slot_minutes")?)?,
            lead_minutes: row.get("lead_minutes").map(parse_u32).transpose()?.unwrap_or(0),
        }),
        "weekly_hours" => Ok(Command::SetWeeklyHours {
            professional_id: row.get("professional_id").map(parse_ulid_expr).transpose()?,
            hours: WeeklyHours {
                weekday: parse_weekday(row.require("day")?)?,
                start: parse_time(row.require("start")?)?,
                end: parse_time(row.require("end")?)?,
                day_off: row.get("day_off").map(parse_bool).transpose()?.unwrap_or(false),
            },
        }),
        "lunch_break" => Ok(Command::SetLunchBreak {
            lunch: LunchBreak {
                active: parse_bool(row.require("active")?)?,
                start: parse_time(row.require("start")?)?,
                end: parse_time(row.require("end")?)?,
            },
        }),
        "special_days" => Ok(Command::UpsertSpecialDay {
            day: SpecialDay {
                id: parse_ulid_expr(row.require("id")?)?,
                date: parse_date(row.require("date")?)?,
                day_off: row.get("day_off").map(parse_bool).transpose()?.unwrap_or(false),
                start: row.get("start").map(parse_time).transpose()?,
                end: row.get("end").map(parse_time).transpose()?,
            },
        }),
        "offerings" => Ok(Command::SaveOffering {
            offering: Offering {
                id: parse_ulid_expr(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                minutes: parse_u32(row.require("minutes")?)?,
                price_cents: row.get("price").map(parse_cents).transpose()?.unwrap_or(0),
            },
        }),
        "professionals" => Ok(Command::SaveProfessional {
            professional: Professional {
                id: parse_ulid_expr(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                login: row.get("login").map(parse_string).transpose()?,
                show_in_agenda: row.get("show_in_agenda").map(parse_bool).transpose()?.unwrap_or(true),
                excluded_offering_ids: row.get("excluded").map(parse_ulid_list).transpose()?.unwrap_or_default(),
            },
        }),
        "appointments" => {
            let lines = match row.get("pets") {
                Some(pets) => parse_pets(pets)?,
                None => Vec::new(),
            };
            let lines = if lines.is_empty() {
                vec![single_line(&row)?]
            } else {
                lines
            };
            Ok(Command::InsertAppointment {
                appointment: NewAppointment {
                    id: parse_ulid_expr(row.require("id")?)?,
                    professional_id: row.get("professional_id").map(parse_ulid_expr).transpose()?,
                    client_name: parse_string(row.require("client_name")?)?,
                    phone: row.get("phone").map(parse_string).transpose()?,
                    start: parse_datetime(row.require("start")?)?,
                    lines,
                },
            })
        }
        "completions" => Ok(Command::CompleteAppointment {
            id: parse_ulid_expr(row.require("appointment_id")?)?,
            payment_method: parse_string(row.require("payment_method")?)?
                .parse()
                .map_err(SqlError::Parse)?,
            lines: match row.get("offering_ids") {
                Some(_) => Some(vec![single_line(&row)?]),
                None => None,
            },
        }),
        "cancellations" => Ok(Command::CancelAppointment {
            id: parse_ulid_expr(row.require("appointment_id")?)?,
        }),
        "reschedules" => Ok(Command::RescheduleAppointment {
            id: parse_ulid_expr(row.require("appointment_id")?)?,
            start: parse_datetime(row.require("start")?)?,
        }),
        "credits" => Ok(Command::InsertCredit {
            credit: NewCredit {
                id: parse_ulid_expr(row.require("id")?)?,
                client_name: parse_string(row.require("client_name")?)?,
                phone: row.get("phone").map(parse_string).transpose()?,
                description: row.get("description").map(parse_string).transpose()?,
                amount_cents: parse_cents(row.require("amount")?)?,
            },
        }),
        "credit_payments" => Ok(Command::InsertCreditPayment {
            id: parse_ulid_expr(row.require("id")?)?,
            credit_id: parse_ulid_expr(row.require("credit_id")?)?,
            amount_cents: parse_cents(row.require("amount")?)?,
            method: row.get("method").map(parse_string).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `offering_ids` with an optional `quantity` as one line item.
fn single_line(row: &Row<'_>) -> Result<LineItem, SqlError> {
    let offering_ids = parse_ulid_list(row.require("offering_ids")?)?;
    let quantity = row.get("quantity").map(parse_u32).transpose()?.unwrap_or(1);
    Ok(LineItem::new(offering_ids).with_quantity(quantity))
}

#[derive(Deserialize)]
struct PetRow {
    name: String,
    #[serde(default)]
    breed: Option<String>,
    #[serde(default = "one")]
    quantity: u32,
    offering_ids: Vec<Ulid>,
}

fn one() -> u32 {
    1
}

fn parse_pets(expr: &Expr) -> Result<Vec<LineItem>, SqlError> {
    let json = parse_string(expr)?;
    let pets: Vec<PetRow> = serde_json::from_str(&json).map_err(|e| SqlError::Parse(format!("bad pets: {e}")))?;
    Ok(pets
        .into_iter()
        .map(|p| {
            LineItem::new(p.offering_ids)
                .with_quantity(p.quantity)
                .for_pet(PetInfo {
                    name: p.name,
                    breed: p.breed,
                })
        })
        .collect())
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "special_days" => Ok(Command::DeleteSpecialDay { id }),
        "offerings" => Ok(Command::DeleteOffering { id }),
        "professionals" => Ok(Command::DeleteProfessional { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        "credits" => Ok(Command::DeleteCredit { id }),
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

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let eq = |col: &str| filters.get(col).filter(|e| !matches!(extract_value(e), Some(Value::Null)));

    match table.as_str() {
        "tenant" => Ok(Command::SelectTenant),
        "weekly_hours" => Ok(Command::SelectWeeklyHours {
            professional_id: eq("professional_id").map(parse_ulid_expr).transpose()?,
        }),
        "lunch_break" => Ok(Command::SelectLunchBreak),
        "special_days" => Ok(Command::SelectSpecialDays),
        "offerings" => Ok(Command::SelectOfferings {
            professional_id: eq("professional_id").map(parse_ulid_expr).transpose()?,
        }),
        "professionals" => Ok(Command::SelectProfessionals {
            agenda_only: eq("in_agenda").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "slots" => {
            let offering_ids = parse_ulid_list(eq("offering_ids").ok_or(SqlError::MissingFilter("offering_ids"))?)?;
            let quantity = eq("quantity").map(parse_u32).transpose()?.unwrap_or(1);
            Ok(Command::SelectSlots {
                date: parse_date(eq("date").ok_or(SqlError::MissingFilter("date"))?)?,
                lines: vec![LineItem::new(offering_ids).with_quantity(quantity)],
                professional_id: eq("professional_id").map(parse_ulid_expr).transpose()?,
            })
        }
        "appointments" => Ok(Command::SelectAppointments {
            date: parse_date(eq("date").ok_or(SqlError::MissingFilter("date"))?)?,
            professional_id: eq("professional_id").map(parse_ulid_expr).transpose()?,
        }),
        "credits" => Ok(Command::SelectCredits {
            pending_only: eq("pending").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality filters joined by AND, keyed by column name.
fn collect_filters(expr: &Expr, filters: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, filters)?;
            collect_filters(right, filters)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            filters.insert(col, right.as_ref().clone());
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, filters),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
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
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

/// A literal's text: quoted strings and bare numbers alike.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    literal_text(expr).map(str::to_owned)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// Comma-separated ULIDs; an empty string is an empty list.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    literal_text(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))))
        .collect()
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = literal_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
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

/// A decimal currency amount (`45`, `45.5`, `'45.50'`) in cents.
fn parse_cents(expr: &Expr) -> Result<Cents, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_cents(expr)?);
    }
    let s = literal_text(expr)?.trim();
    let bad = || SqlError::Parse(format!("bad amount: {s:?}"));
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || (whole.is_empty() && frac.is_empty()) {
        return Err(bad());
    }
    let units: Cents = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| bad())? };
    let cents: Cents = format!("{frac:0<2}").parse().map_err(|_| bad())?;
    let total = units
        .checked_mul(100)
        .and_then(|u| u.checked_add(cents))
        .ok_or_else(bad)?;
    Ok(if negative { -total } else { total })
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = literal_text(expr)?.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

/// A local datetime (`'2030-01-07 09:30'`, ISO `T` form, optional seconds)
/// or raw epoch milliseconds.
fn parse_datetime(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::Number(..)) = extract_value(expr) {
        return parse_i64_expr(expr);
    }
    let s = literal_text(expr)?.trim();
    ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(datetime_ms)
        .ok_or_else(|| SqlError::Parse(format!("bad datetime: {s:?}")))
}

/// Weekday by name (`mon`, `monday`) or number with 0 = Sunday.
fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = literal_text(expr)?.trim();
    if let Ok(n) = s.parse::<u8>() {
        const BY_NUMBER: [Weekday; 7] = [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ];
        return BY_NUMBER
            .get(usize::from(n))
            .copied()
            .ok_or_else(|| SqlError::Parse(format!("weekday {n} out of range")));
    }
    s.parse().map_err(|_| SqlError::Parse(format!("bad weekday: {s:?}")))
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
    #[error("expected at most {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            _ => "42601",
        }
    }
}
