//! Keyed daily/monthly tables shared by the in-process stores

use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::model::{DailyRecord, MonthlyRecord, MonthlyTotal, Port, Rule, StreamKey, YearMonth};

type DailyKey = (Port, Rule, NaiveDate);
type MonthlyKey = (Port, Rule, YearMonth);

/// The two record tables, keyed by their composite keys
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordTables {
    daily: BTreeMap<DailyKey, DailyRecord>,
    monthly: BTreeMap<MonthlyKey, MonthlyRecord>,
}

impl RecordTables {
    pub(crate) fn from_records(daily: Vec<DailyRecord>, monthly: Vec<MonthlyRecord>) -> Self {
        let mut tables = Self::default();
        for record in daily {
            tables.put_daily(record);
        }
        for record in monthly {
            tables.put_monthly(record);
        }
        tables
    }

    pub(crate) fn get_daily(&self, stream: StreamKey, date: NaiveDate) -> Option<&DailyRecord> {
        self.daily.get(&(stream.port, stream.rule, date))
    }

    pub(crate) fn put_daily(&mut self, record: DailyRecord) {
        self.daily
            .insert((record.port, record.rule, record.date), record);
    }

    pub(crate) fn get_monthly(&self, stream: StreamKey, month: YearMonth) -> Option<&MonthlyRecord> {
        self.monthly.get(&(stream.port, stream.rule, month))
    }

    pub(crate) fn put_monthly(&mut self, record: MonthlyRecord) {
        self.monthly
            .insert((record.port, record.rule, record.month), record);
    }

    pub(crate) fn sum_daily_net_for_month(&self, month: YearMonth) -> Vec<MonthlyTotal> {
        let mut totals: BTreeMap<(Port, Rule), u64> = BTreeMap::new();
        for record in self.daily.values().filter(|r| month.contains(r.date)) {
            let total = totals.entry((record.port, record.rule)).or_default();
            *total = total.saturating_add(record.net());
        }

        totals
            .into_iter()
            .map(|((port, rule), total)| MonthlyTotal { port, rule, total })
            .collect()
    }

    pub(crate) fn latest_daily_date(&self) -> Option<NaiveDate> {
        self.daily.keys().map(|(_, _, date)| *date).max()
    }

    pub(crate) fn daily_records(&self) -> Vec<DailyRecord> {
        self.daily.values().cloned().collect()
    }

    pub(crate) fn monthly_records(&self) -> Vec<MonthlyRecord> {
        self.monthly.values().cloned().collect()
    }

    pub(crate) fn daily_len(&self) -> usize {
        self.daily.len()
    }

    pub(crate) fn monthly_len(&self) -> usize {
        self.monthly.len()
    }
}
