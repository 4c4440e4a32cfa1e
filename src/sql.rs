use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{NewBooking, PaymentOutcome, QuoteInput, QuoteResponse};
use crate::model::*;
use crate::timezone;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProfile {
        id: Ulid,
        kind: ResourceKind,
        timezone: Tz,
    },
    SetWeeklyHours {
        rows: Vec<(Ulid, Weekday, DaySchedule)>,
    },
    UpdatePreference {
        resource_id: Ulid,
        preference: AvailabilityPreference,
    },
    InsertBlockedRange {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: Option<String>,
    },
    DeleteBlockedRange {
        id: Ulid,
    },
    InsertProject {
        project: Project,
    },
    InsertBooking {
        booking: NewBooking,
    },
    InsertQuote {
        booking_id: Ulid,
        quote: QuoteInput,
    },
    InsertQuoteResponse {
        booking_id: Ulid,
        response: QuoteResponse,
    },
    ReopenRfq {
        booking_id: Ulid,
    },
    InsertTransition {
        booking_id: Ulid,
        status: BookingStatus,
        refund_cents: Option<u64>,
    },
    InsertConfirmation {
        booking_id: Ulid,
        start: Option<Ms>,
    },
    InsertPaymentCallback {
        booking_id: Ulid,
        outcome: PaymentOutcome,
    },
    RetryPayment {
        booking_id: Ulid,
    },
    InsertAnswers {
        booking_id: Ulid,
        answers: Vec<Answer>,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectPayment {
        booking_id: Ulid,
    },
    SelectProposals {
        project_id: Ulid,
        subproject_index: usize,
        viewer_tz: Option<Tz>,
    },
    SelectFreeSpans {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    let values = &rows[0];

    match table.as_str() {
        "profiles" => {
            require_arity("profiles", values, 5)?;
            let id = parse_ulid(&values[0])?;
            let kind = match parse_string(&values[1])?.as_str() {
                "company" => ResourceKind::Company,
                "employee" => ResourceKind::Employee {
                    company_id: parse_ulid_or_null(&values[2])?
                        .ok_or(SqlError::MissingValue("company_id"))?,
                    preference: match parse_string_or_null(&values[3])? {
                        Some(p) => parse_preference(&p)?,
                        None => AvailabilityPreference::SameAsCompany,
                    },
                },
                other => return Err(SqlError::Parse(format!("bad profile kind: {other}"))),
            };
            let timezone = timezone::parse_tz(&parse_string(&values[4])?).map_err(SqlError::Parse)?;
            Ok(Command::InsertProfile { id, kind, timezone })
        }
        "weekly_hours" => {
            let mut parsed = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                require_arity("weekly_hours row", row, 4)?;
                parsed.push(parse_weekly_row(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?);
            }
            Ok(Command::SetWeeklyHours { rows: parsed })
        }
        "profile_preferences" => {
            require_arity("profile_preferences", values, 2)?;
            Ok(Command::UpdatePreference {
                resource_id: parse_ulid(&values[0])?,
                preference: parse_preference(&parse_string(&values[1])?)?,
            })
        }
        "blocked_ranges" => {
            require_arity("blocked_ranges", values, 4)?;
            Ok(Command::InsertBlockedRange {
                id: parse_ulid(&values[0])?,
                resource_id: parse_ulid(&values[1])?,
                span: Span::new(parse_i64(&values[2])?, parse_i64(&values[3])?),
                reason: match values.get(4) {
                    Some(v) => parse_string_or_null(v)?,
                    None => None,
                },
            })
        }
        "projects" => {
            require_arity("projects", values, 4)?;
            let subprojects: Vec<Subproject> = serde_json::from_str(&parse_string(&values[3])?)
                .map_err(|e| SqlError::Json("subprojects", e.to_string()))?;
            Ok(Command::InsertProject {
                project: Project {
                    id: parse_ulid(&values[0])?,
                    company_id: parse_ulid(&values[1])?,
                    category: parse_string(&values[2])?,
                    subprojects,
                },
            })
        }
        "bookings" => {
            require_arity("bookings", values, 9)?;
            let budget = match (parse_u64_or_null(&values[7])?, parse_u64_or_null(&values[8])?) {
                (Some(min_cents), Some(max_cents)) => Some(BudgetRange { min_cents, max_cents }),
                (None, None) => None,
                _ => return Err(SqlError::Parse("budget_min and budget_max go together".into())),
            };
            Ok(Command::InsertBooking {
                booking: NewBooking {
                    id: parse_ulid(&values[0])?,
                    professional_id: parse_ulid(&values[1])?,
                    project_id: parse_ulid_or_null(&values[2])?,
                    subproject_index: parse_u64_or_null(&values[3])?.map(|i| i as usize),
                    rfq: RfqData {
                        service_type: parse_string(&values[4])?,
                        description: parse_string_or_null(&values[5])?.unwrap_or_default(),
                        desired_start: parse_i64_or_null(&values[6])?,
                        budget,
                    },
                },
            })
        }
        "quotes" => {
            require_arity("quotes", values, 4)?;
            let breakdown = match values.get(4).map(parse_string_or_null).transpose()?.flatten() {
                Some(json) => serde_json::from_str(&json).map_err(|e| SqlError::Json("breakdown", e.to_string()))?,
                None => Vec::new(),
            };
            Ok(Command::InsertQuote {
                booking_id: parse_ulid(&values[0])?,
                quote: QuoteInput {
                    amount_cents: parse_u64(&values[1])?,
                    currency: parse_string(&values[2])?,
                    description: parse_string(&values[3])?,
                    breakdown,
                },
            })
        }
        "quote_responses" => {
            require_arity("quote_responses", values, 2)?;
            let start = match values.get(2) {
                Some(v) => parse_i64_or_null(v)?,
                None => None,
            };
            let response = match parse_string(&values[1])?.as_str() {
                "accept" => QuoteResponse::Accept { start },
                "reject" => QuoteResponse::Reject,
                other => return Err(SqlError::Parse(format!("bad quote action: {other}"))),
            };
            Ok(Command::InsertQuoteResponse {
                booking_id: parse_ulid(&values[0])?,
                response,
            })
        }
        "rfq_reopenings" => {
            require_arity("rfq_reopenings", values, 1)?;
            Ok(Command::ReopenRfq {
                booking_id: parse_ulid(&values[0])?,
            })
        }
        "transitions" => {
            require_arity("transitions", values, 2)?;
            let status = BookingStatus::from_str(&parse_string(&values[1])?).map_err(SqlError::Parse)?;
            Ok(Command::InsertTransition {
                booking_id: parse_ulid(&values[0])?,
                status,
                refund_cents: match values.get(2) {
                    Some(v) => parse_u64_or_null(v)?,
                    None => None,
                },
            })
        }
        "confirmations" => {
            require_arity("confirmations", values, 1)?;
            Ok(Command::InsertConfirmation {
                booking_id: parse_ulid(&values[0])?,
                start: match values.get(1) {
                    Some(v) => parse_i64_or_null(v)?,
                    None => None,
                },
            })
        }
        "payment_callbacks" => {
            require_arity("payment_callbacks", values, 2)?;
            let detail = match values.get(2) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            let outcome = match parse_string(&values[1])?.as_str() {
                "authorized" => PaymentOutcome::Authorized {
                    reference: detail.ok_or(SqlError::MissingValue("reference"))?,
                },
                "declined" => PaymentOutcome::Declined {
                    reason: detail.unwrap_or_else(|| "declined".into()),
                },
                other => return Err(SqlError::Parse(format!("bad payment outcome: {other}"))),
            };
            Ok(Command::InsertPaymentCallback {
                booking_id: parse_ulid(&values[0])?,
                outcome,
            })
        }
        "payment_retries" => {
            require_arity("payment_retries", values, 1)?;
            Ok(Command::RetryPayment {
                booking_id: parse_ulid(&values[0])?,
            })
        }
        "post_booking_answers" => {
            require_arity("post_booking_answers", values, 3)?;
            let booking_id = parse_ulid(&values[0])?;
            let mut answers = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                require_arity("post_booking_answers row", row, 3)?;
                if parse_ulid(&row[0])? != booking_id {
                    return Err(SqlError::Parse(format!("row {i}: answers must target one booking")));
                }
                answers.push(Answer {
                    question_id: parse_string(&row[1])?,
                    value: parse_answer(&row[2], row.get(3))
                        .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                });
            }
            Ok(Command::InsertAnswers { booking_id, answers })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "blocked_ranges" => Ok(Command::DeleteBlockedRange { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality and range filters collected from a WHERE clause.
#[derive(Default)]
struct Filters {
    eq: Vec<(String, Expr)>,
    start: Option<Ms>,
    end: Option<Ms>,
}

impl Filters {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.eq.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.get(column).ok_or(SqlError::MissingFilter(column))?)
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "bookings" => Ok(Command::SelectBooking {
            id: filters.ulid("id")?,
        }),
        "payments" => Ok(Command::SelectPayment {
            booking_id: filters.ulid("booking_id")?,
        }),
        "schedule_proposals" => {
            let index = filters
                .get("subproject_index")
                .ok_or(SqlError::MissingFilter("subproject_index"))?;
            let viewer_tz = filters
                .get("viewer_tz")
                .map(|e| parse_string(e).and_then(|s| timezone::parse_tz(&s).map_err(SqlError::Parse)))
                .transpose()?;
            Ok(Command::SelectProposals {
                project_id: filters.ulid("project_id")?,
                subproject_index: parse_u64(index)? as usize,
                viewer_tz,
            })
        }
        "free_spans" => Ok(Command::SelectFreeSpans {
            resource_id: filters.ulid("resource_id")?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    filters.eq.push((col, (**right).clone()));
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_i64(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_i64(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Column parsers ────────────────────────────────────────────

fn parse_weekly_row(row: &[Expr]) -> Result<(Ulid, Weekday, DaySchedule), SqlError> {
    let resource_id = parse_ulid(&row[0])?;
    let day = parse_string(&row[1])?;
    let weekday = Weekday::from_str(&day).map_err(|_| SqlError::Parse(format!("bad weekday: {day}")))?;
    let schedule = match (parse_string_or_null(&row[2])?, parse_string_or_null(&row[3])?) {
        (Some(start), Some(end)) => DaySchedule::hours(parse_time(&start)?, parse_time(&end)?),
        (None, None) => DaySchedule::off(),
        _ => return Err(SqlError::Parse("start and end must both be set or both be NULL".into())),
    };
    Ok((resource_id, weekday, schedule))
}

/// `HH:MM` or `HH:MM:SS`; `24:00` is accepted for end-of-day midnight.
fn parse_time(s: &str) -> Result<NaiveTime, SqlError> {
    if s == "24:00" || s == "24:00:00" {
        return Ok(NaiveTime::MIN);
    }
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| SqlError::Parse(format!("bad time: {s}")))
}

fn parse_preference(s: &str) -> Result<AvailabilityPreference, SqlError> {
    match s {
        "personal" => Ok(AvailabilityPreference::Personal),
        "same_as_company" => Ok(AvailabilityPreference::SameAsCompany),
        other => Err(SqlError::Parse(format!("bad preference: {other}"))),
    }
}

/// Strings become text answers unless the optional kind column says `choice`.
fn parse_answer(expr: &Expr, kind: Option<&Expr>) -> Result<AnswerValue, SqlError> {
    let kind = kind.map(parse_string_or_null).transpose()?.flatten();
    let value = extract_value(expr).ok_or_else(|| SqlError::Parse(format!("expected value, got {expr:?}")))?;
    match (value, kind.as_deref()) {
        (Value::Boolean(b), _) => Ok(AnswerValue::Flag(*b)),
        (Value::Number(n, _), _) => n
            .parse()
            .map(AnswerValue::Number)
            .map_err(|e| SqlError::Parse(format!("bad number: {e}"))),
        (Value::SingleQuotedString(s), Some("choice")) => Ok(AnswerValue::Choice(s.clone())),
        (Value::SingleQuotedString(s), None | Some("text")) => Ok(AnswerValue::Text(s.clone())),
        (_, Some(other)) => Err(SqlError::Parse(format!("bad answer kind: {other}"))),
        (other, None) => Err(SqlError::Parse(format!("unsupported answer value: {other:?}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn require_arity(table: &'static str, values: &[Expr], expected: usize) -> Result<(), SqlError> {
    if values.len() < expected {
        return Err(SqlError::WrongArity(table, expected, values.len()));
    }
    Ok(())
}

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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
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

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

fn parse_u64_or_null(expr: &Expr) -> Result<Option<u64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u64(expr).map(Some)
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
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("bad JSON in {0}: {1}")]
    Json(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_insert_company_profile() {
        let sql = format!(
            "INSERT INTO profiles (id, kind, company_id, preference, timezone) VALUES ('{ID}', 'company', NULL, NULL, 'Europe/Amsterdam')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertProfile { id: got, kind, timezone } => {
                assert_eq!(got, id());
                assert_eq!(kind, ResourceKind::Company);
                assert_eq!(timezone, chrono_tz::Europe::Amsterdam);
            }
            cmd => panic!("expected InsertProfile, got {cmd:?}"),
        }
    }

    #[test]
    fn employee_preference_defaults_to_company() {
        let sql = format!(
            "INSERT INTO profiles (id, kind, company_id, preference, timezone) VALUES ('{OTHER}', 'employee', '{ID}', NULL, 'UTC')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertProfile { kind, .. } => assert_eq!(
                kind,
                ResourceKind::Employee {
                    company_id: id(),
                    preference: AvailabilityPreference::SameAsCompany
                }
            ),
            cmd => panic!("expected InsertProfile, got {cmd:?}"),
        }
    }

    #[test]
    fn employee_without_company_rejected() {
        let sql = format!(
            "INSERT INTO profiles (id, kind, company_id, preference, timezone) VALUES ('{OTHER}', 'employee', NULL, 'personal', 'UTC')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingValue("company_id"))));
    }

    #[test]
    fn unknown_timezone_rejected() {
        let sql = format!(
            "INSERT INTO profiles (id, kind, company_id, preference, timezone) VALUES ('{ID}', 'company', NULL, NULL, 'Mars/Olympus')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_weekly_hours_multi_row() {
        let sql = format!(
            r#"INSERT INTO weekly_hours (resource_id, day, start, "end") VALUES ('{ID}', 'mon', '09:00', '17:30'), ('{ID}', 'sunday', NULL, NULL), ('{ID}', 'fri', '08:00', '24:00')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SetWeeklyHours { rows } => {
                assert_eq!(rows.len(), 3);
                assert_eq!(rows[0].1, Weekday::Mon);
                assert_eq!(
                    rows[0].2,
                    DaySchedule::hours(
                        NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                        NaiveTime::from_hms_opt(17, 30, 0).unwrap()
                    )
                );
                assert_eq!(rows[1], (id(), Weekday::Sun, DaySchedule::off()));
                assert!(rows[2].2.ends_at_midnight());
            }
            cmd => panic!("expected SetWeeklyHours, got {cmd:?}"),
        }
    }

    #[test]
    fn weekly_hours_half_null_rejected() {
        let sql = format!(
            r#"INSERT INTO weekly_hours (resource_id, day, start, "end") VALUES ('{ID}', 'mon', '09:00', NULL)"#
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.to_string().contains("row 0"), "{err}");
    }

    #[test]
    fn parse_blocked_range_and_delete() {
        let sql = format!(
            r#"INSERT INTO blocked_ranges (id, resource_id, start, "end", reason) VALUES ('{ID}', '{OTHER}', 1000, 2000, 'holiday')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBlockedRange {
                id: id(),
                resource_id: Ulid::from_string(OTHER).unwrap(),
                span: Span::new(1000, 2000),
                reason: Some("holiday".into()),
            }
        );

        let sql = format!("DELETE FROM blocked_ranges WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBlockedRange { id: id() });
    }

    #[test]
    fn parse_project_with_json_subprojects() {
        let json = format!(
            r#"[{{"name":"kitchen","pricing":{{"fixed":{{"amount_cents":250000}}}},"execution":{{"value":2,"unit":"days"}},"buffer":{{"value":1,"unit":"days"}},"resources":["{OTHER}"]}}]"#
        );
        let sql = format!(
            "INSERT INTO projects (id, company_id, category, subprojects) VALUES ('{ID}', '{OTHER}', 'renovation', '{json}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertProject { project } => {
                assert_eq!(project.category, "renovation");
                let sub = &project.subprojects[0];
                assert_eq!(sub.execution, TimeAmount::days(2));
                assert_eq!(sub.buffer, Some(TimeAmount::days(1)));
                assert_eq!(sub.min_resources, 1);
                assert_eq!(sub.min_overlap_percentage, 90);
                assert_eq!(sub.pricing, Pricing::Fixed { amount_cents: 250_000 });
            }
            cmd => panic!("expected InsertProject, got {cmd:?}"),
        }
    }

    #[test]
    fn bad_subproject_json_names_column() {
        let sql = format!(
            "INSERT INTO projects (id, company_id, category, subprojects) VALUES ('{ID}', '{OTHER}', 'cleaning', '[{{}}]')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Json("subprojects", _))));
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            "INSERT INTO bookings (id, professional_id, project_id, subproject_index, service_type, description, desired_start, budget_min, budget_max) VALUES ('{ID}', '{OTHER}', NULL, NULL, 'plumbing', 'leak', 1700000000000, 10000, 20000)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { booking } => {
                assert_eq!(booking.project_id, None);
                assert_eq!(booking.rfq.desired_start, Some(1_700_000_000_000));
                assert_eq!(
                    booking.rfq.budget,
                    Some(BudgetRange {
                        min_cents: 10_000,
                        max_cents: 20_000
                    })
                );
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_quote_with_breakdown() {
        let sql = format!(
            r#"INSERT INTO quotes (booking_id, amount, currency, description, breakdown) VALUES ('{ID}', 150000, 'EUR', 'tiles', '[{{"label":"labour","amount_cents":100000}},{{"label":"material","amount_cents":50000}}]')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertQuote { quote, .. } => {
                assert_eq!(quote.amount_cents, 150_000);
                assert_eq!(quote.breakdown.len(), 2);
                assert_eq!(quote.breakdown[1].label, "material");
            }
            cmd => panic!("expected InsertQuote, got {cmd:?}"),
        }
    }

    #[test]
    fn negative_amount_rejected() {
        let sql = format!(
            "INSERT INTO quotes (booking_id, amount, currency, description) VALUES ('{ID}', -5, 'EUR', 'x')"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_quote_responses() {
        let sql = format!("INSERT INTO quote_responses (booking_id, action, start) VALUES ('{ID}', 'accept', 1000)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertQuoteResponse {
                booking_id: id(),
                response: QuoteResponse::Accept { start: Some(1000) }
            }
        );
        let sql = format!("INSERT INTO quote_responses (booking_id, action) VALUES ('{ID}', 'reject')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertQuoteResponse {
                booking_id: id(),
                response: QuoteResponse::Reject
            }
        );
    }

    #[test]
    fn parse_transition_with_refund() {
        let sql = format!(
            "INSERT INTO transitions (booking_id, status, refund_amount) VALUES ('{ID}', 'refunded', 5000)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertTransition {
                booking_id: id(),
                status: BookingStatus::Refunded,
                refund_cents: Some(5000),
            }
        );
        let sql = format!("INSERT INTO transitions (booking_id, status) VALUES ('{ID}', 'on_hold')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_payment_callbacks() {
        let sql = format!(
            "INSERT INTO payment_callbacks (booking_id, outcome, reference) VALUES ('{ID}', 'authorized', 'pi_123')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertPaymentCallback {
                booking_id: id(),
                outcome: PaymentOutcome::Authorized {
                    reference: "pi_123".into()
                },
            }
        );
        let sql = format!(
            "INSERT INTO payment_callbacks (booking_id, outcome, reference) VALUES ('{ID}', 'authorized', NULL)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingValue("reference"))));
    }

    #[test]
    fn parse_single_column_commands() {
        assert_eq!(
            parse_sql(&format!("INSERT INTO rfq_reopenings (booking_id) VALUES ('{ID}')")).unwrap(),
            Command::ReopenRfq { booking_id: id() }
        );
        assert_eq!(
            parse_sql(&format!("INSERT INTO payment_retries (booking_id) VALUES ('{ID}')")).unwrap(),
            Command::RetryPayment { booking_id: id() }
        );
        assert_eq!(
            parse_sql(&format!("INSERT INTO confirmations (booking_id, start) VALUES ('{ID}', NULL)")).unwrap(),
            Command::InsertConfirmation {
                booking_id: id(),
                start: None
            }
        );
    }

    #[test]
    fn parse_answers_multi_row() {
        let sql = format!(
            "INSERT INTO post_booking_answers (booking_id, question_id, answer, kind) VALUES ('{ID}', 'floor', 3, NULL), ('{ID}', 'pets', true, NULL), ('{ID}', 'access', 'side door', NULL), ('{ID}', 'parking', 'street', 'choice')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAnswers { answers, .. } => {
                let values: Vec<_> = answers.into_iter().map(|a| a.value).collect();
                assert_eq!(
                    values,
                    vec![
                        AnswerValue::Number(3.0),
                        AnswerValue::Flag(true),
                        AnswerValue::Text("side door".into()),
                        AnswerValue::Choice("street".into()),
                    ]
                );
            }
            cmd => panic!("expected InsertAnswers, got {cmd:?}"),
        }
    }

    #[test]
    fn answers_for_two_bookings_rejected() {
        let sql = format!(
            "INSERT INTO post_booking_answers (booking_id, question_id, answer) VALUES ('{ID}', 'a', 'x'), ('{OTHER}', 'b', 'y')"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_selects() {
        assert_eq!(
            parse_sql(&format!("SELECT * FROM bookings WHERE id = '{ID}'")).unwrap(),
            Command::SelectBooking { id: id() }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM payments WHERE booking_id = '{ID}'")).unwrap(),
            Command::SelectPayment { booking_id: id() }
        );
        assert_eq!(
            parse_sql(&format!(
                "SELECT * FROM schedule_proposals WHERE project_id = '{ID}' AND subproject_index = 0 AND viewer_tz = 'Asia/Tokyo'"
            ))
            .unwrap(),
            Command::SelectProposals {
                project_id: id(),
                subproject_index: 0,
                viewer_tz: Some(chrono_tz::Asia::Tokyo),
            }
        );
        assert_eq!(
            parse_sql(&format!(
                "SELECT * FROM free_spans WHERE resource_id = '{ID}' AND start >= 1000 AND \"end\" <= 2000"
            ))
            .unwrap(),
            Command::SelectFreeSpans {
                resource_id: id(),
                start: 1000,
                end: 2000
            }
        );
    }

    #[test]
    fn proposals_need_subproject_index() {
        let sql = format!("SELECT * FROM schedule_proposals WHERE project_id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingFilter("subproject_index"))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
