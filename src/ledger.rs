use crate::billing::{
    aggregate_with, AggregateOptions, FamilyNameParts, Ledger, StudentName, TransactionRecord,
    DEFAULT_RECENT_ACTIVITY_LIMIT, UNKNOWN_FAMILY_NAME,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize)]
pub struct BillingError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl BillingError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn query(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BillingError {}

/// Workspace-level knobs for the ledger views, stored under `setup.billing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BillingSettings {
    pub recent_activity_limit: usize,
    pub unknown_type_label: String,
    pub unknown_family_label: String,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            recent_activity_limit: DEFAULT_RECENT_ACTIVITY_LIMIT,
            unknown_type_label: "Unknown".to_string(),
            unknown_family_label: UNKNOWN_FAMILY_NAME.to_string(),
        }
    }
}

impl BillingSettings {
    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            recent_activity_limit: self.recent_activity_limit,
            unknown_family_label: self.unknown_family_label.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerContext<'a> {
    pub conn: &'a Connection,
    pub season_id: &'a str,
}

/// Largest accepted amount magnitude, in currency units.
pub const MAX_AMOUNT_MAGNITUDE: i64 = 1_000_000_000_000_000;

fn in_amount_range(v: &Decimal) -> bool {
    v.abs() <= Decimal::from(MAX_AMOUNT_MAGNITUDE)
}

/// Out-of-range values parse as `None`, the same as malformed text.
pub fn parse_amount_str(raw: &str) -> Option<Decimal> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    Decimal::from_str(t)
        .or_else(|_| Decimal::from_scientific(t))
        .ok()
        .filter(in_amount_range)
}

/// Reads an amount out of whatever storage class SQLite handed back.
pub fn amount_from_sql(value: ValueRef<'_>) -> Option<Decimal> {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => None,
        ValueRef::Integer(i) => Some(Decimal::from(i)).filter(in_amount_range),
        ValueRef::Real(f) => Decimal::from_f64_retain(f)
            .map(|d| d.round_dp(2))
            .filter(in_amount_range),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok().and_then(parse_amount_str),
    }
}

/// Accepts JSON numbers and decimal strings.
pub fn amount_from_json(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => parse_amount_str(&n.to_string()),
        serde_json::Value::String(s) => parse_amount_str(s),
        _ => None,
    }
}

/// RFC 3339, or SQLite's `YYYY-MM-DD HH:MM:SS` treated as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let t = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

struct BalanceRow {
    transaction_id: i64,
    updated_at: Option<String>,
    family_id: i64,
    name_parts: FamilyNameParts,
    type_label: Option<String>,
    amount: Option<Decimal>,
}

fn load_rosters(
    conn: &Connection,
    season_id: &str,
) -> Result<HashMap<i64, Vec<StudentName>>, BillingError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.family_id, s.chinese_name, s.first_name, s.last_name
             FROM students s
             WHERE s.family_id IN (SELECT DISTINCT family_id FROM balances WHERE season_id = ?)
             ORDER BY s.family_id, s.sort_order, s.id",
        )
        .map_err(BillingError::query)?;
    let rows = stmt
        .query_map([season_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                StudentName {
                    chinese_name: r.get(1)?,
                    first_name: r.get(2)?,
                    last_name: r.get(3)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(BillingError::query)?;

    let mut by_family: HashMap<i64, Vec<StudentName>> = HashMap::new();
    for (family_id, student) in rows {
        by_family.entry(family_id).or_default().push(student);
    }
    Ok(by_family)
}

/// Loads every balance entry of a season inside one read transaction.
/// Entries are never dropped: a missing or unparseable amount becomes 0 and
/// an unparseable timestamp becomes the Unix epoch.
pub fn load_season_transactions(
    conn: &Connection,
    season_id: &str,
    unknown_type_label: &str,
) -> Result<Vec<TransactionRecord>, BillingError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| BillingError::new("db_tx_failed", e.to_string()))?;

    let exists: Option<i64> = tx
        .query_row("SELECT 1 FROM seasons WHERE id = ?", [season_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(BillingError::query)?;
    if exists.is_none() {
        return Err(BillingError::new("not_found", "season not found"));
    }

    let rosters = load_rosters(&tx, season_id)?;

    let balances: Vec<BalanceRow> = {
        let mut stmt = tx
            .prepare(
                "SELECT
                   b.id,
                   b.updated_at,
                   b.family_id,
                   f.father_chinese_name,
                   f.mother_chinese_name,
                   f.father_first_name,
                   f.father_last_name,
                   f.mother_first_name,
                   f.mother_last_name,
                   t.label,
                   b.amount
                 FROM balances b
                 LEFT JOIN families f ON f.id = b.family_id
                 LEFT JOIN balance_types t ON t.id = b.type_id
                 WHERE b.season_id = ?
                 ORDER BY b.updated_at DESC, b.id DESC",
            )
            .map_err(BillingError::query)?;
        let rows = stmt
            .query_map([season_id], |r| {
                Ok(BalanceRow {
                    transaction_id: r.get(0)?,
                    updated_at: r.get(1)?,
                    family_id: r.get(2)?,
                    name_parts: FamilyNameParts {
                        father_chinese_name: r.get(3)?,
                        mother_chinese_name: r.get(4)?,
                        father_first_name: r.get(5)?,
                        father_last_name: r.get(6)?,
                        mother_first_name: r.get(7)?,
                        mother_last_name: r.get(8)?,
                    },
                    type_label: r.get(9)?,
                    amount: amount_from_sql(r.get_ref(10)?),
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(BillingError::query)?;
        rows
    };
    tx.commit()
        .map_err(|e| BillingError::new("db_tx_failed", e.to_string()))?;

    let mut records = Vec::with_capacity(balances.len());
    for b in balances {
        let raw_amount = match b.amount {
            Some(v) => v,
            None => {
                tracing::warn!(
                    transaction_id = b.transaction_id,
                    season_id,
                    "balance amount missing or malformed, counting as 0"
                );
                Decimal::ZERO
            }
        };
        let timestamp = match b.updated_at.as_deref().and_then(parse_timestamp) {
            Some(ts) => ts,
            None => {
                tracing::warn!(
                    transaction_id = b.transaction_id,
                    raw = b.updated_at.as_deref().unwrap_or(""),
                    "balance timestamp unparseable, using epoch"
                );
                DateTime::<Utc>::default()
            }
        };
        let student_roster = rosters.get(&b.family_id).cloned().unwrap_or_default();
        records.push(TransactionRecord {
            transaction_id: b.transaction_id,
            timestamp,
            family_id: b.family_id,
            family_name_parts: b.name_parts,
            student_roster,
            raw_amount,
            type_label: b
                .type_label
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| unknown_type_label.to_string()),
        });
    }

    Ok(records)
}

pub fn compute_season_ledger(
    ctx: &LedgerContext<'_>,
    settings: &BillingSettings,
) -> Result<Ledger, BillingError> {
    let records = load_season_transactions(ctx.conn, ctx.season_id, &settings.unknown_type_label)?;
    Ok(aggregate_with(&records, &settings.aggregate_options()))
}
