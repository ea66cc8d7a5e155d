use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

pub const UNKNOWN_FAMILY_NAME: &str = "Unknown";
pub const DEFAULT_RECENT_ACTIVITY_LIMIT: usize = 2;

/// Guardian name fields as joined from the family record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyNameParts {
    pub father_chinese_name: Option<String>,
    pub mother_chinese_name: Option<String>,
    pub father_first_name: Option<String>,
    pub father_last_name: Option<String>,
    pub mother_first_name: Option<String>,
    pub mother_last_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentName {
    pub chinese_name: String,
    pub first_name: String,
    pub last_name: String,
}

impl StudentName {
    fn trimmed(&self) -> Self {
        Self {
            chinese_name: self.chinese_name.trim().to_string(),
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
        }
    }

    fn is_blank(&self) -> bool {
        self.chinese_name.is_empty() && self.first_name.is_empty() && self.last_name.is_empty()
    }
}

/// One balance entry for a season, denormalized with its family and type.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub transaction_id: i64,
    pub timestamp: DateTime<Utc>,
    pub family_id: i64,
    pub family_name_parts: FamilyNameParts,
    pub student_roster: Vec<StudentName>,
    pub raw_amount: Decimal,
    pub type_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingRow {
    pub transaction_id: i64,
    pub timestamp: DateTime<Utc>,
    pub family_name: String,
    pub family_id: i64,
    pub type_label: String,
    pub raw_amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Paid,
    Partial,
    Unpaid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyRow {
    pub family_id: i64,
    pub family_name: String,
    pub student_roster: Vec<StudentName>,
    pub total_billed: Decimal,
    pub total_paid: Decimal,
    pub balance: Decimal,
    pub payment_status: PaymentStatus,
    pub last_activity: DateTime<Utc>,
    pub recent_activity: Vec<BillingRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingSummary {
    pub total_billed: Decimal,
    pub total_collected: Decimal,
    pub total_outstanding: Decimal,
    pub collection_progress_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub global_rows: Vec<BillingRow>,
    pub family_rows: Vec<FamilyRow>,
    pub summary: BillingSummary,
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub recent_activity_limit: usize,
    pub unknown_family_label: String,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            recent_activity_limit: DEFAULT_RECENT_ACTIVITY_LIMIT,
            unknown_family_label: UNKNOWN_FAMILY_NAME.to_string(),
        }
    }
}

/// Currency values always carry two fraction digits.
pub fn money(mut value: Decimal) -> Decimal {
    value.rescale(2);
    value
}

fn trimmed(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn join_first_last(first: Option<&str>, last: Option<&str>) -> Option<String> {
    match (first, last) {
        (Some(f), Some(l)) => Some(format!("{f} {l}")),
        (Some(v), None) | (None, Some(v)) => Some(v.to_string()),
        (None, None) => None,
    }
}

/// Chinese names win; otherwise "First Last" per parent, parents joined by "-".
/// `None` when no name data survives trimming.
pub fn resolve_family_name_opt(parts: &FamilyNameParts) -> Option<String> {
    let chinese: Vec<&str> = [&parts.father_chinese_name, &parts.mother_chinese_name]
        .into_iter()
        .filter_map(trimmed)
        .collect();
    if !chinese.is_empty() {
        return Some(chinese.join("-"));
    }

    let english: Vec<String> = [
        (&parts.father_first_name, &parts.father_last_name),
        (&parts.mother_first_name, &parts.mother_last_name),
    ]
    .into_iter()
    .filter_map(|(first, last)| join_first_last(trimmed(first), trimmed(last)))
    .collect();
    let joined = english.join("-");
    let joined = joined.trim();
    if joined.is_empty() {
        None
    } else {
        Some(joined.to_string())
    }
}

pub fn resolve_family_name(parts: &FamilyNameParts) -> String {
    resolve_family_name_opt(parts).unwrap_or_else(|| UNKNOWN_FAMILY_NAME.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountSplit {
    pub billed: Decimal,
    pub paid: Decimal,
}

/// Positive amounts are charges, negative amounts are payments.
pub fn classify_amount(raw: Decimal) -> AmountSplit {
    AmountSplit {
        billed: money(raw.max(Decimal::ZERO)),
        paid: money((-raw).max(Decimal::ZERO)),
    }
}

pub fn payment_status(total_billed: Decimal, total_paid: Decimal) -> PaymentStatus {
    if total_paid >= total_billed {
        PaymentStatus::Paid
    } else if total_paid > Decimal::ZERO {
        PaymentStatus::Partial
    } else {
        PaymentStatus::Unpaid
    }
}

/// Nothing billed counts as fully collected. Over-collection is not clamped.
/// Ratios too large for `Decimal` fall back to f64 arithmetic.
pub fn collection_progress_percent(total_billed: Decimal, total_collected: Decimal) -> f64 {
    if total_billed.is_zero() {
        return 100.0;
    }
    match total_collected
        .checked_div(total_billed)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
    {
        Some(percent) => percent.to_f64().unwrap_or(0.0),
        None => {
            let billed = total_billed.to_f64().unwrap_or(f64::MAX);
            let collected = total_collected.to_f64().unwrap_or(0.0);
            collected / billed * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryTotals {
    pub billed: Decimal,
    pub collected: Decimal,
    pub outstanding: Decimal,
}

impl SummaryTotals {
    /// An entry that would overflow any total is left out of all three.
    pub fn add(&mut self, split: AmountSplit) {
        let next = (
            self.billed.checked_add(split.billed),
            self.collected.checked_add(split.paid),
            self.outstanding.checked_add(split.billed - split.paid),
        );
        match next {
            (Some(billed), Some(collected), Some(outstanding)) => {
                self.billed = billed;
                self.collected = collected;
                self.outstanding = outstanding;
            }
            _ => tracing::warn!(
                billed = %split.billed,
                paid = %split.paid,
                "season totals overflowed, entry left out of summary"
            ),
        }
    }

    pub fn finalize(self) -> BillingSummary {
        BillingSummary {
            total_billed: money(self.billed),
            total_collected: money(self.collected),
            total_outstanding: money(self.outstanding),
            collection_progress_percent: collection_progress_percent(self.billed, self.collected),
        }
    }
}

/// Fixed-capacity window holding the most recent rows by timestamp, oldest
/// at the front. A full window evicts its oldest row to admit a newer one.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentActivity {
    capacity: usize,
    rows: VecDeque<BillingRow>,
}

impl RecentActivity {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            rows: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns the row that fell out of the window, if any: either the
    /// evicted oldest row or `row` itself when it is not newer than the
    /// oldest row of a full window.
    pub fn offer(&mut self, row: BillingRow) -> Option<BillingRow> {
        if self.rows.len() < self.capacity {
            self.insert_ordered(row);
            return None;
        }
        let newer_than_oldest = self
            .rows
            .front()
            .map(|oldest| row.timestamp > oldest.timestamp)
            .unwrap_or(true);
        if !newer_than_oldest {
            return Some(row);
        }
        let evicted = self.rows.pop_front();
        self.insert_ordered(row);
        evicted
    }

    fn insert_ordered(&mut self, row: BillingRow) {
        let at = self
            .rows
            .iter()
            .position(|r| r.timestamp > row.timestamp)
            .unwrap_or(self.rows.len());
        self.rows.insert(at, row);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_vec(self) -> Vec<BillingRow> {
        self.rows.into()
    }
}

/// Trim every field, drop blank entries and exact duplicates, keep order.
pub fn normalize_roster(roster: &[StudentName]) -> Vec<StudentName> {
    let mut seen: HashSet<StudentName> = HashSet::new();
    let mut out = Vec::with_capacity(roster.len());
    for student in roster {
        let t = student.trimmed();
        if t.is_blank() {
            continue;
        }
        if seen.insert(t.clone()) {
            out.push(t);
        }
    }
    out
}

#[derive(Debug)]
struct FamilyAccumulator {
    family_id: i64,
    family_name: String,
    student_roster: Vec<StudentName>,
    total_billed: Decimal,
    total_paid: Decimal,
    last_activity: Option<DateTime<Utc>>,
    recent: RecentActivity,
}

impl FamilyAccumulator {
    fn new(family_id: i64, family_name: String, roster: &[StudentName], limit: usize) -> Self {
        Self {
            family_id,
            family_name,
            student_roster: normalize_roster(roster),
            total_billed: Decimal::ZERO,
            total_paid: Decimal::ZERO,
            last_activity: None,
            recent: RecentActivity::new(limit),
        }
    }

    fn absorb(&mut self, split: AmountSplit, row: &BillingRow) {
        match (
            self.total_billed.checked_add(split.billed),
            self.total_paid.checked_add(split.paid),
        ) {
            (Some(billed), Some(paid)) => {
                self.total_billed = billed;
                self.total_paid = paid;
            }
            _ => tracing::warn!(
                family_id = self.family_id,
                transaction_id = row.transaction_id,
                "family totals overflowed, entry left out of totals"
            ),
        }
        if self.last_activity.map(|t| row.timestamp > t).unwrap_or(true) {
            self.last_activity = Some(row.timestamp);
        }
        if let Some(dropped) = self.recent.offer(row.clone()) {
            tracing::trace!(
                family_id = self.family_id,
                transaction_id = dropped.transaction_id,
                "row left recent activity window"
            );
        }
    }

    fn into_row(self) -> FamilyRow {
        let total_billed = money(self.total_billed);
        let total_paid = money(self.total_paid);
        FamilyRow {
            family_id: self.family_id,
            family_name: self.family_name,
            student_roster: self.student_roster,
            total_billed,
            total_paid,
            balance: money(total_billed - total_paid),
            payment_status: payment_status(total_billed, total_paid),
            last_activity: self.last_activity.unwrap_or_default(),
            recent_activity: self.recent.into_vec(),
        }
    }
}

#[cfg(test)]
pub fn aggregate(records: &[TransactionRecord]) -> Ledger {
    aggregate_with(records, &AggregateOptions::default())
}

/// Folds a season's balance entries into the global feed, per-family rollups
/// and the season summary. Input order does not matter: the feed is always
/// newest first, ties broken by the higher transaction id.
pub fn aggregate_with(records: &[TransactionRecord], opts: &AggregateOptions) -> Ledger {
    let mut ordered: Vec<&TransactionRecord> = records.iter().collect();
    ordered.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.transaction_id.cmp(&a.transaction_id))
    });

    let mut totals = SummaryTotals::default();
    let mut global_rows: Vec<BillingRow> = Vec::with_capacity(ordered.len());
    let mut families: Vec<FamilyAccumulator> = Vec::new();
    let mut slot_by_family: HashMap<i64, usize> = HashMap::new();
    let mut unknown_count: usize = 0;

    for record in ordered {
        let split = classify_amount(record.raw_amount);
        totals.add(split);

        let slot = match slot_by_family.get(&record.family_id) {
            Some(&slot) => slot,
            None => {
                let name = resolve_family_name_opt(&record.family_name_parts).unwrap_or_else(|| {
                    let name = format!("{} {}", opts.unknown_family_label, unknown_count);
                    unknown_count += 1;
                    name
                });
                families.push(FamilyAccumulator::new(
                    record.family_id,
                    name,
                    &record.student_roster,
                    opts.recent_activity_limit,
                ));
                slot_by_family.insert(record.family_id, families.len() - 1);
                families.len() - 1
            }
        };

        let family = &mut families[slot];
        let row = BillingRow {
            transaction_id: record.transaction_id,
            timestamp: record.timestamp,
            family_name: family.family_name.clone(),
            family_id: record.family_id,
            type_label: record.type_label.clone(),
            raw_amount: money(record.raw_amount),
        };
        family.absorb(split, &row);
        global_rows.push(row);
    }

    let family_rows: Vec<FamilyRow> = families.into_iter().map(FamilyAccumulator::into_row).collect();
    let summary = totals.finalize();
    tracing::debug!(
        transactions = global_rows.len(),
        families = family_rows.len(),
        unknown_families = unknown_count,
        "aggregated billing ledger"
    );

    Ledger {
        global_rows,
        family_rows,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, day, 12, 0, 0).unwrap()
    }

    fn chinese(father: &str) -> FamilyNameParts {
        FamilyNameParts {
            father_chinese_name: Some(father.to_string()),
            ..Default::default()
        }
    }

    fn tx(id: i64, day: u32, family_id: i64, parts: FamilyNameParts, amount: Decimal) -> TransactionRecord {
        TransactionRecord {
            transaction_id: id,
            timestamp: at(day),
            family_id,
            family_name_parts: parts,
            student_roster: Vec::new(),
            raw_amount: amount,
            type_label: "Tuition".to_string(),
        }
    }

    #[test]
    fn chinese_names_take_precedence() {
        let parts = FamilyNameParts {
            father_chinese_name: Some(" 王大明 ".into()),
            mother_chinese_name: Some("李美".into()),
            father_first_name: Some("David".into()),
            father_last_name: Some("Wang".into()),
            ..Default::default()
        };
        assert_eq!(resolve_family_name(&parts), "王大明-李美");
    }

    #[test]
    fn english_names_omit_space_for_single_part() {
        let parts = FamilyNameParts {
            father_chinese_name: Some("   ".into()),
            father_first_name: Some("John".into()),
            mother_last_name: Some(" Smith ".into()),
            ..Default::default()
        };
        assert_eq!(resolve_family_name(&parts), "John-Smith");

        let both = FamilyNameParts {
            father_first_name: Some("John".into()),
            father_last_name: Some("Smith".into()),
            mother_first_name: Some("Jane".into()),
            mother_last_name: Some("Doe".into()),
            ..Default::default()
        };
        assert_eq!(resolve_family_name(&both), "John Smith-Jane Doe");
    }

    #[test]
    fn blank_names_resolve_unknown() {
        let parts = FamilyNameParts {
            father_first_name: Some("  ".into()),
            mother_chinese_name: Some("".into()),
            ..Default::default()
        };
        assert_eq!(resolve_family_name(&parts), UNKNOWN_FAMILY_NAME);
        assert_eq!(resolve_family_name_opt(&parts), None);
    }

    #[test]
    fn classify_splits_sign() {
        assert_eq!(
            classify_amount(dec!(120.50)),
            AmountSplit { billed: dec!(120.50), paid: dec!(0) }
        );
        assert_eq!(
            classify_amount(dec!(-80)),
            AmountSplit { billed: dec!(0), paid: dec!(80) }
        );
        assert_eq!(
            classify_amount(Decimal::ZERO),
            AmountSplit { billed: dec!(0), paid: dec!(0) }
        );
        assert_eq!(classify_amount(dec!(3)).billed.to_string(), "3.00");
    }

    #[test]
    fn status_law() {
        assert_eq!(payment_status(dec!(100), dec!(100)), PaymentStatus::Paid);
        assert_eq!(payment_status(dec!(100), dec!(150)), PaymentStatus::Paid);
        assert_eq!(payment_status(dec!(100), dec!(0.01)), PaymentStatus::Partial);
        assert_eq!(payment_status(dec!(100), dec!(0)), PaymentStatus::Unpaid);
    }

    #[test]
    fn progress_is_not_clamped() {
        assert_eq!(collection_progress_percent(dec!(0), dec!(0)), 100.0);
        assert_eq!(collection_progress_percent(dec!(200), dec!(50)), 25.0);
        assert_eq!(collection_progress_percent(dec!(100), dec!(150)), 150.0);
    }

    #[test]
    fn single_charge_is_unpaid() {
        let ledger = aggregate(&[tx(1, 1, 10, chinese("王"), dec!(500.00))]);
        assert_eq!(ledger.global_rows.len(), 1);
        assert_eq!(ledger.summary.total_billed, dec!(500.00));
        assert_eq!(ledger.summary.total_collected, dec!(0));
        assert_eq!(ledger.summary.total_outstanding, dec!(500.00));
        assert_eq!(ledger.summary.collection_progress_percent, 0.0);
        assert_eq!(ledger.family_rows[0].payment_status, PaymentStatus::Unpaid);
        assert_eq!(ledger.family_rows[0].family_name, "王");
    }

    #[test]
    fn bill_then_full_payment_is_paid() {
        let ledger = aggregate(&[
            tx(2, 2, 10, chinese("王"), dec!(-500.00)),
            tx(1, 1, 10, chinese("王"), dec!(500.00)),
        ]);
        assert_eq!(ledger.family_rows.len(), 1);
        let family = &ledger.family_rows[0];
        assert_eq!(family.total_billed, dec!(500.00));
        assert_eq!(family.total_paid, dec!(500.00));
        assert_eq!(family.balance, dec!(0));
        assert_eq!(family.payment_status, PaymentStatus::Paid);
        assert_eq!(family.last_activity, at(2));
        assert_eq!(ledger.summary.collection_progress_percent, 100.0);
        assert_eq!(ledger.summary.total_outstanding, dec!(0));
    }

    #[test]
    fn empty_input_is_zero_state() {
        let ledger = aggregate(&[]);
        assert!(ledger.global_rows.is_empty());
        assert!(ledger.family_rows.is_empty());
        assert_eq!(
            ledger.summary,
            BillingSummary {
                total_billed: dec!(0),
                total_collected: dec!(0),
                total_outstanding: dec!(0),
                collection_progress_percent: 100.0,
            }
        );
    }

    #[test]
    fn recent_activity_keeps_two_newest_oldest_first() {
        let ledger = aggregate(&[
            tx(3, 3, 10, chinese("王"), dec!(30)),
            tx(2, 2, 10, chinese("王"), dec!(20)),
            tx(1, 1, 10, chinese("王"), dec!(10)),
        ]);
        let recent = &ledger.family_rows[0].recent_activity;
        let ids: Vec<i64> = recent.iter().map(|r| r.transaction_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(ledger.family_rows[0].total_billed, dec!(60));
    }

    #[test]
    fn unrelated_unnamed_families_get_distinct_buckets() {
        let ledger = aggregate(&[
            tx(2, 2, 20, FamilyNameParts::default(), dec!(100)),
            tx(1, 1, 21, FamilyNameParts::default(), dec!(200)),
        ]);
        let names: Vec<&str> = ledger.family_rows.iter().map(|f| f.family_name.as_str()).collect();
        assert_eq!(names, vec!["Unknown 0", "Unknown 1"]);
        assert_eq!(ledger.global_rows[0].family_name, "Unknown 0");
        assert_eq!(ledger.global_rows[1].family_name, "Unknown 1");
    }

    #[test]
    fn same_unnamed_family_merges() {
        let ledger = aggregate(&[
            tx(3, 3, 20, FamilyNameParts::default(), dec!(100)),
            tx(2, 2, 21, FamilyNameParts::default(), dec!(50)),
            tx(1, 1, 20, FamilyNameParts::default(), dec!(-100)),
        ]);
        assert_eq!(ledger.family_rows.len(), 2);
        let first = &ledger.family_rows[0];
        assert_eq!(first.family_id, 20);
        assert_eq!(first.family_name, "Unknown 0");
        assert_eq!(first.payment_status, PaymentStatus::Paid);
        assert_eq!(ledger.family_rows[1].family_name, "Unknown 1");
    }

    #[test]
    fn families_with_colliding_names_stay_apart() {
        let ledger = aggregate(&[
            tx(2, 2, 30, chinese("陈"), dec!(100)),
            tx(1, 1, 31, chinese("陈"), dec!(-40)),
        ]);
        assert_eq!(ledger.family_rows.len(), 2);
        assert!(ledger.family_rows.iter().all(|f| f.family_name == "陈"));
    }

    #[test]
    fn zero_amount_only_appends_activity() {
        let ledger = aggregate(&[
            tx(2, 2, 10, chinese("王"), Decimal::ZERO),
            tx(1, 1, 10, chinese("王"), dec!(100)),
        ]);
        let family = &ledger.family_rows[0];
        assert_eq!(family.total_billed, dec!(100));
        assert_eq!(family.total_paid, dec!(0));
        assert_eq!(family.payment_status, PaymentStatus::Unpaid);
        assert_eq!(family.recent_activity.len(), 2);
        assert_eq!(family.recent_activity[1].raw_amount, dec!(0));
    }

    #[test]
    fn unsorted_input_is_reordered() {
        let ledger = aggregate(&[
            tx(1, 1, 10, chinese("王"), dec!(10)),
            tx(3, 3, 10, chinese("王"), dec!(30)),
            tx(2, 2, 10, chinese("王"), dec!(20)),
        ]);
        let feed: Vec<i64> = ledger.global_rows.iter().map(|r| r.transaction_id).collect();
        assert_eq!(feed, vec![3, 2, 1]);
        let recent: Vec<i64> = ledger.family_rows[0]
            .recent_activity
            .iter()
            .map(|r| r.transaction_id)
            .collect();
        assert_eq!(recent, vec![2, 3]);
        assert_eq!(ledger.family_rows[0].last_activity, at(3));
    }

    #[test]
    fn equal_timestamps_break_ties_by_transaction_id() {
        let ledger = aggregate(&[
            tx(5, 1, 10, chinese("王"), dec!(1)),
            tx(9, 1, 11, chinese("李"), dec!(1)),
        ]);
        let feed: Vec<i64> = ledger.global_rows.iter().map(|r| r.transaction_id).collect();
        assert_eq!(feed, vec![9, 5]);
    }

    #[test]
    fn totals_near_decimal_max_do_not_overflow() {
        let huge = Decimal::from_scientific("5e28").unwrap();
        let ledger = aggregate(&[
            tx(1, 1, 10, chinese("王"), huge),
            tx(2, 2, 11, chinese("李"), huge),
        ]);
        assert_eq!(ledger.global_rows.len(), 2);
        assert_eq!(ledger.family_rows.len(), 2);
        // The older entry no longer fits the season total.
        assert_eq!(ledger.summary.total_billed, huge);
        assert_eq!(ledger.summary.total_outstanding, huge);
        assert!(ledger.family_rows.iter().all(|f| f.total_billed == huge));

        let mut one = SummaryTotals::default();
        one.add(classify_amount(Decimal::MAX));
        one.add(classify_amount(Decimal::MAX));
        assert_eq!(one.billed, Decimal::MAX);
        assert_eq!(one.collected, Decimal::ZERO);
    }

    #[test]
    fn progress_beyond_decimal_range_stays_finite() {
        let ledger = aggregate(&[
            tx(1, 1, 10, chinese("王"), dec!(0.01)),
            tx(2, 2, 11, chinese("李"), -Decimal::from_scientific("5e28").unwrap()),
        ]);
        let percent = ledger.summary.collection_progress_percent;
        assert!(percent.is_finite());
        assert!(percent > 1e30, "percent {}", percent);
        assert_eq!(ledger.family_rows[0].payment_status, PaymentStatus::Paid);
    }

    #[test]
    fn ring_evicts_oldest_first() {
        let row = |id: i64, day: u32| BillingRow {
            transaction_id: id,
            timestamp: at(day),
            family_name: "王".into(),
            family_id: 1,
            type_label: "Tuition".into(),
            raw_amount: dec!(1),
        };
        let mut ring = RecentActivity::new(2);
        assert_eq!(ring.offer(row(1, 1)), None);
        assert_eq!(ring.offer(row(2, 2)), None);
        let evicted = ring.offer(row(3, 3)).expect("evicts");
        assert_eq!(evicted.transaction_id, 1);
        let rejected = ring.offer(row(4, 1)).expect("rejects older");
        assert_eq!(rejected.transaction_id, 4);
        assert_eq!(ring.len(), 2);
        let ids: Vec<i64> = ring.into_vec().iter().map(|r| r.transaction_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn custom_limit_and_label() {
        let opts = AggregateOptions {
            recent_activity_limit: 3,
            unknown_family_label: "未知".to_string(),
        };
        let records: Vec<TransactionRecord> = (1..=5)
            .map(|i| tx(i, i as u32, 7, FamilyNameParts::default(), dec!(10)))
            .collect();
        let ledger = aggregate_with(&records, &opts);
        let family = &ledger.family_rows[0];
        assert_eq!(family.family_name, "未知 0");
        let ids: Vec<i64> = family.recent_activity.iter().map(|r| r.transaction_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn roster_is_trimmed_and_deduped() {
        let roster = vec![
            StudentName {
                chinese_name: " 小明 ".into(),
                first_name: "Ming ".into(),
                last_name: "Wang".into(),
            },
            StudentName {
                chinese_name: "小明".into(),
                first_name: "Ming".into(),
                last_name: " Wang".into(),
            },
            StudentName::default(),
        ];
        let out = normalize_roster(&roster);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].chinese_name, "小明");
        assert_eq!(out[0].first_name, "Ming");
    }

    fn arb_parts() -> impl Strategy<Value = FamilyNameParts> {
        prop_oneof![
            Just(FamilyNameParts::default()),
            "[a-z]{1,6}".prop_map(|s| FamilyNameParts {
                father_first_name: Some(s),
                ..Default::default()
            }),
        ]
    }

    fn arb_records() -> impl Strategy<Value = Vec<TransactionRecord>> {
        let family_table = proptest::collection::vec(arb_parts(), 6);
        (
            family_table,
            proptest::collection::vec((0i64..6, -100_000i64..100_000i64, 0i64..1_000_000), 0..40),
        )
            .prop_map(|(names, entries)| {
                entries
                    .into_iter()
                    .enumerate()
                    .map(|(i, (family_id, cents, secs))| TransactionRecord {
                        transaction_id: i as i64,
                        timestamp: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
                        family_id,
                        family_name_parts: names[family_id as usize].clone(),
                        student_roster: Vec::new(),
                        raw_amount: Decimal::new(cents, 2),
                        type_label: "Tuition".to_string(),
                    })
                    .collect()
            })
    }

    proptest! {
        #[test]
        fn summary_matches_classified_sums(records in arb_records()) {
            let ledger = aggregate(&records);
            let billed: Decimal = records.iter().map(|r| r.raw_amount.max(Decimal::ZERO)).sum();
            let paid: Decimal = records.iter().map(|r| (-r.raw_amount).max(Decimal::ZERO)).sum();
            prop_assert_eq!(ledger.summary.total_billed, billed);
            prop_assert_eq!(ledger.summary.total_collected, paid);
            prop_assert_eq!(ledger.summary.total_outstanding, billed - paid);
            prop_assert_eq!(ledger.global_rows.len(), records.len());
        }

        #[test]
        fn family_totals_and_window_hold(records in arb_records()) {
            let ledger = aggregate(&records);
            for family in &ledger.family_rows {
                let mine: Vec<&TransactionRecord> =
                    records.iter().filter(|r| r.family_id == family.family_id).collect();
                let billed: Decimal = mine.iter().map(|r| classify_amount(r.raw_amount).billed).sum();
                let paid: Decimal = mine.iter().map(|r| classify_amount(r.raw_amount).paid).sum();
                prop_assert_eq!(family.total_billed, billed);
                prop_assert_eq!(family.total_paid, paid);
                prop_assert!(family.recent_activity.len() <= DEFAULT_RECENT_ACTIVITY_LIMIT);
                prop_assert_eq!(family.payment_status == PaymentStatus::Paid, paid >= billed);
                if billed > Decimal::ZERO && paid.is_zero() {
                    prop_assert_eq!(family.payment_status, PaymentStatus::Unpaid);
                }
            }
            let distinct: HashSet<i64> = records.iter().map(|r| r.family_id).collect();
            prop_assert_eq!(ledger.family_rows.len(), distinct.len());
        }

        #[test]
        fn aggregation_is_idempotent(records in arb_records()) {
            prop_assert_eq!(aggregate(&records), aggregate(&records));
        }

        #[test]
        fn unnamed_buckets_are_distinct(families in proptest::collection::vec(arb_parts(), 0..20)) {
            let records: Vec<TransactionRecord> = families
                .iter()
                .enumerate()
                .map(|(i, parts)| tx(i as i64, 1, 100 + i as i64, parts.clone(), dec!(1)))
                .collect();
            let ledger = aggregate(&records);
            let unknown: HashSet<&str> = ledger
                .family_rows
                .iter()
                .map(|f| f.family_name.as_str())
                .filter(|n| n.starts_with("Unknown "))
                .collect();
            let expected = families.iter().filter(|p| resolve_family_name_opt(p).is_none()).count();
            prop_assert_eq!(unknown.len(), expected);
        }
    }
}
