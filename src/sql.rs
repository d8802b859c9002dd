use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::SlotRequest;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `SELECT * FROM slots WHERE day = '2026-02-10' [AND coach_id = ..] [AND location_id = ..]
    /// [AND duration = <minutes>] [AND step = <minutes>]`
    SelectSlots(SlotRequest),
    SelectActivities {
        day: NaiveDate,
        location_id: Option<LocationId>,
        coach_id: Option<CoachId>,
    },
    SelectActivity {
        id: Ulid,
    },
    /// `INSERT INTO bookings VALUES (start, "end", coach_id, location_id, notes,
    /// whole_day, participant_count, table_count, target_user_id)`; trailing
    /// values may be omitted and a NULL end means the default duration.
    InsertBooking(BookingRequest),
    /// `INSERT INTO blocks VALUES (start, "end", location_id, coach_id, notes, recurring)`
    InsertBlock(BlockRequest),
    /// `INSERT INTO status_changes VALUES (activity_id, status)`
    ChangeStatus {
        id: Ulid,
        status: Status,
    },
    DeleteActivity {
        id: Ulid,
    },
    /// `SET SESSION AUTHORIZATION 'user'`; `None` restores the login user.
    SetAuthorization {
        user: Option<UserId>,
    },
    /// `SET ROLE coach`; `RESET ROLE` goes back to player.
    SetRole {
        role: Role,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(cmd) = parse_session_command(trimmed)? {
        return Ok(cmd);
    }

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

// ── Session commands ──────────────────────────────────────────

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let head = s.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &s[keyword.len()..];
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn unquote(s: &str) -> &str {
    s.trim()
        .trim_matches(|c| c == '\'' || c == '"')
}

/// Session-level statements are matched textually, ahead of the SQL parser.
fn parse_session_command(sql: &str) -> Result<Option<Command>, SqlError> {
    if let Some(rest) = strip_keyword(sql, "SET SESSION AUTHORIZATION") {
        if rest.eq_ignore_ascii_case("DEFAULT") {
            return Ok(Some(Command::SetAuthorization { user: None }));
        }
        let user = unquote(rest);
        if user.is_empty() {
            return Err(SqlError::Parse("SET SESSION AUTHORIZATION needs a user".into()));
        }
        return Ok(Some(Command::SetAuthorization { user: Some(user.to_string()) }));
    }
    if strip_keyword(sql, "RESET SESSION AUTHORIZATION").is_some() {
        return Ok(Some(Command::SetAuthorization { user: None }));
    }
    if let Some(rest) = strip_keyword(sql, "SET ROLE") {
        let name = unquote(rest.trim_start_matches(['=', ' ']).trim_start_matches("TO ").trim());
        let role = if name.eq_ignore_ascii_case("NONE") {
            Role::Player
        } else {
            Role::parse(name).ok_or_else(|| SqlError::Parse(format!("unknown role: {name}")))?
        };
        return Ok(Some(Command::SetRole { role }));
    }
    if strip_keyword(sql, "RESET ROLE").is_some() {
        return Ok(Some(Command::SetRole { role: Role::Player }));
    }
    Ok(None)
}

// ── Statements ────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let at = |i: usize| values.get(i);

    match table.as_str() {
        "bookings" => {
            let start = at(0).ok_or(SqlError::WrongArity("bookings", 1, 0))?;
            Ok(Command::InsertBooking(BookingRequest {
                start: parse_i64_expr(start)?,
                end: optional(at(1), parse_i64_expr)?,
                duration: None,
                coach_id: optional(at(2), parse_string_expr)?,
                location_id: optional(at(3), parse_string_expr)?,
                notes: optional(at(4), parse_string_expr)?,
                whole_day: optional(at(5), parse_bool)?.unwrap_or(false),
                participant_count: optional(at(6), parse_u32)?,
                table_count: optional(at(7), parse_u32)?,
                target_user_id: optional(at(8), parse_string_expr)?,
            }))
        }
        "blocks" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("blocks", 2, values.len()));
            }
            Ok(Command::InsertBlock(BlockRequest {
                start: parse_i64_expr(&values[0])?,
                end: Some(parse_i64_expr(&values[1])?),
                duration: None,
                location_id: optional(at(2), parse_string_expr)?,
                coach_id: optional(at(3), parse_string_expr)?,
                notes: optional(at(4), parse_string_expr)?,
                recurring: optional(at(5), parse_bool)?.unwrap_or(false),
            }))
        }
        "status_changes" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("status_changes", 2, values.len()));
            }
            let raw = parse_string_expr(&values[1])?;
            let status = Status::parse(&raw)
                .ok_or_else(|| SqlError::Parse(format!("unknown status: {raw}")))?;
            Ok(Command::ChangeStatus {
                id: parse_ulid_expr(&values[0])?,
                status,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" | "blocks" | "activities" => Ok(Command::DeleteActivity { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters);
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "slots" => {
            let day = filter("day").ok_or(SqlError::MissingFilter("day"))?;
            Ok(Command::SelectSlots(SlotRequest {
                day: parse_date_expr(day)?,
                coach_id: optional(filter("coach_id"), parse_string_expr)?,
                location_id: optional(filter("location_id"), parse_string_expr)?,
                duration: optional(filter("duration"), parse_minutes)?,
                step: optional(filter("step"), parse_minutes)?,
            }))
        }
        "activities" | "bookings" => {
            if let Some(id) = filter("id") {
                return Ok(Command::SelectActivity { id: parse_ulid_expr(id)? });
            }
            let day = filter("day").ok_or(SqlError::MissingFilter("day"))?;
            Ok(Command::SelectActivities {
                day: parse_date_expr(day)?,
                location_id: optional(filter("location_id"), parse_string_expr)?,
                coach_id: optional(filter("coach_id"), parse_string_expr)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, out);
            collect_eq_filters(right, out);
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, right));
            }
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => {}
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("one row per INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Vec::new();
    collect_eq_filters(sel, &mut filters);
    match filters.iter().find(|(c, _)| c == "id") {
        Some((_, value)) => parse_ulid_expr(value),
        None => Err(SqlError::MissingFilter("id")),
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

/// Absent and NULL both mean "not given".
fn optional<T>(
    expr: Option<&Expr>,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match expr {
        Some(e) if !is_null(e) => parse(e).map(Some),
        _ => Ok(None),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_minutes(expr: &Expr) -> Result<Ms, SqlError> {
    let v = parse_i64_expr(expr)?;
    v.checked_mul(MINUTE)
        .ok_or_else(|| SqlError::Parse(format!("{v} minutes out of range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
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
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parse_select_slots_minimal() {
        let cmd = parse_sql("SELECT * FROM slots WHERE day = '2026-02-10'").unwrap();
        assert_eq!(cmd, Command::SelectSlots(SlotRequest::for_day(day(2026, 2, 10))));
    }

    #[test]
    fn parse_select_slots_with_filters() {
        let sql = "SELECT * FROM slots WHERE day = '2026-02-10' AND coach_id = 'C1' \
                   AND location_id = 'bakaric' AND duration = 60 AND step = 15";
        match parse_sql(sql).unwrap() {
            Command::SelectSlots(req) => {
                assert_eq!(req.day, day(2026, 2, 10));
                assert_eq!(req.coach_id.as_deref(), Some("C1"));
                assert_eq!(req.location_id.as_deref(), Some("bakaric"));
                assert_eq!(req.duration, Some(60 * MINUTE));
                assert_eq!(req.step, Some(15 * MINUTE));
            }
            cmd => panic!("expected SelectSlots, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_slots_rejects_oversized_minutes() {
        for col in ["duration", "step"] {
            let sql = format!("SELECT * FROM slots WHERE day = '2026-02-10' AND {col} = 9223372036854775807");
            assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))), "{col}");
        }
    }

    #[test]
    fn parse_select_slots_requires_day() {
        assert!(matches!(
            parse_sql("SELECT * FROM slots WHERE coach_id = 'C1'"),
            Err(SqlError::MissingFilter("day"))
        ));
        assert!(matches!(parse_sql("SELECT * FROM slots"), Err(SqlError::MissingFilter("day"))));
        assert!(matches!(
            parse_sql("SELECT * FROM slots WHERE day = '10.02.2026'"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_select_activities() {
        let cmd = parse_sql("SELECT * FROM activities WHERE day = '2026-02-10' AND coach_id = 'C1'").unwrap();
        assert_eq!(
            cmd,
            Command::SelectActivities {
                day: day(2026, 2, 10),
                location_id: None,
                coach_id: Some("C1".into()),
            }
        );
        let cmd = parse_sql(&format!("SELECT * FROM activities WHERE id = '{ID}'")).unwrap();
        assert!(matches!(cmd, Command::SelectActivity { id } if id.to_string() == ID));
    }

    #[test]
    fn parse_insert_booking_minimal() {
        let cmd = parse_sql("INSERT INTO bookings (start) VALUES (1770714000000)").unwrap();
        assert_eq!(
            cmd,
            Command::InsertBooking(BookingRequest {
                start: 1_770_714_000_000,
                ..Default::default()
            })
        );
    }

    #[test]
    fn parse_insert_booking_full() {
        let sql = r#"INSERT INTO bookings (start, "end", coach_id, location_id, notes, whole_day, participant_count, table_count, target_user_id)
                     VALUES (1000, NULL, 'C1', 'bakaric', 'serve practice', false, 4, 2, 'p9')"#;
        match parse_sql(sql).unwrap() {
            Command::InsertBooking(req) => {
                assert_eq!(req.start, 1000);
                assert_eq!(req.end, None);
                assert_eq!(req.coach_id.as_deref(), Some("C1"));
                assert_eq!(req.location_id.as_deref(), Some("bakaric"));
                assert_eq!(req.notes.as_deref(), Some("serve practice"));
                assert!(!req.whole_day);
                assert_eq!(req.participant_count, Some(4));
                assert_eq!(req.table_count, Some(2));
                assert_eq!(req.target_user_id.as_deref(), Some("p9"));
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_whole_day_booking() {
        let sql = "INSERT INTO bookings VALUES (1000, NULL, NULL, NULL, 'party', true)";
        match parse_sql(sql).unwrap() {
            Command::InsertBooking(req) => {
                assert!(req.whole_day);
                assert_eq!(req.coach_id, None);
                assert_eq!(req.notes.as_deref(), Some("party"));
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_block() {
        let sql = r#"INSERT INTO blocks (start, "end", location_id, coach_id, notes, recurring)
                     VALUES (1000, 2000, 'bakaric', NULL, 'league match', true)"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertBlock(BlockRequest {
                start: 1000,
                end: Some(2000),
                duration: None,
                location_id: Some("bakaric".into()),
                coach_id: None,
                notes: Some("league match".into()),
                recurring: true,
            })
        );
        assert!(matches!(
            parse_sql("INSERT INTO blocks (start) VALUES (1000)"),
            Err(SqlError::WrongArity("blocks", 2, 1))
        ));
    }

    #[test]
    fn parse_status_change() {
        let sql = format!("INSERT INTO status_changes (activity_id, status) VALUES ('{ID}', 'canceled')");
        match parse_sql(&sql).unwrap() {
            Command::ChangeStatus { id, status } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(status, Status::Cancelled);
            }
            cmd => panic!("expected ChangeStatus, got {cmd:?}"),
        }
        let sql = format!("INSERT INTO status_changes VALUES ('{ID}', 'archived')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_delete_booking() {
        let cmd = parse_sql(&format!("DELETE FROM bookings WHERE id = '{ID}'")).unwrap();
        assert!(matches!(cmd, Command::DeleteActivity { id } if id.to_string() == ID));
        assert!(matches!(
            parse_sql("DELETE FROM bookings WHERE coach_id = 'C1'"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_session_authorization() {
        assert_eq!(
            parse_sql("SET SESSION AUTHORIZATION 'ana'").unwrap(),
            Command::SetAuthorization { user: Some("ana".into()) }
        );
        assert_eq!(
            parse_sql("set session authorization default;").unwrap(),
            Command::SetAuthorization { user: None }
        );
        assert_eq!(
            parse_sql("RESET SESSION AUTHORIZATION").unwrap(),
            Command::SetAuthorization { user: None }
        );
    }

    #[test]
    fn parse_set_role() {
        assert_eq!(parse_sql("SET ROLE coach").unwrap(), Command::SetRole { role: Role::Coach });
        assert_eq!(parse_sql("SET ROLE 'admin';").unwrap(), Command::SetRole { role: Role::Admin });
        assert_eq!(parse_sql("RESET ROLE").unwrap(), Command::SetRole { role: Role::Player });
        assert!(matches!(parse_sql("SET ROLE superuser"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn multi_row_insert_is_unsupported() {
        let sql = "INSERT INTO bookings (start) VALUES (1000), (2000)";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM chat WHERE day = '2026-02-10'"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
