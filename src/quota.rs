//! Persistent per-day send quota.
//!
//! "Today" is re-derived on every call, so a run that crosses midnight
//! starts counting against the new day. The counter for a day is loaded
//! from the store the first time that day is seen and written back on
//! every increment, which lets a restarted process resume mid-day.

use std::sync::Arc;

use chrono::{Local, NaiveDate};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::store::Database;

/// Source of the current calendar day.
pub type DayClock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QuotaState {
    day: NaiveDate,
    used: u32,
}

/// Point-in-time view of today's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub day: NaiveDate,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

pub struct DailyQuota {
    store: Arc<dyn Database>,
    limit: u32,
    clock: DayClock,
    state: Mutex<Option<QuotaState>>,
}

impl DailyQuota {
    /// Quota keyed on the local calendar day.
    pub fn new(store: Arc<dyn Database>, limit: u32) -> Self {
        Self::with_clock(store, limit, Arc::new(|| Local::now().date_naive()))
    }

    pub fn with_clock(store: Arc<dyn Database>, limit: u32, clock: DayClock) -> Self {
        Self {
            store,
            limit,
            clock,
            state: Mutex::new(None),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Whether `count` more sends fit into today's limit.
    pub async fn can_send(&self, count: u32) -> Result<bool, DatabaseError> {
        let mut guard = self.state.lock().await;
        let state = self.today(&mut guard).await?;
        Ok(state.used.saturating_add(count) <= self.limit)
    }

    /// Check and increment in one step.
    ///
    /// Returns `false` without touching the counter when `count` does not
    /// fit. A failed write is logged and the reservation still stands, so
    /// the in-memory count never under-reports what was attempted.
    pub async fn try_reserve(&self, count: u32) -> Result<bool, DatabaseError> {
        let mut guard = self.state.lock().await;
        let state = self.today(&mut guard).await?;
        if state.used.saturating_add(count) > self.limit {
            return Ok(false);
        }
        state.used += count;
        let (day, used) = (state.day, state.used);

        if let Err(e) = self.store.save_quota(day, used, self.limit).await {
            warn!(%day, used, error = %e, "Failed to persist quota reservation");
        }
        Ok(true)
    }

    /// Unconditionally add `count` to today's counter and persist it.
    pub async fn register(&self, count: u32) -> Result<(), DatabaseError> {
        let mut guard = self.state.lock().await;
        let state = self.today(&mut guard).await?;
        state.used = state.used.saturating_add(count);
        let (day, used) = (state.day, state.used);
        self.store.save_quota(day, used, self.limit).await
    }

    pub async fn used(&self) -> Result<u32, DatabaseError> {
        let mut guard = self.state.lock().await;
        Ok(self.today(&mut guard).await?.used)
    }

    pub async fn remaining(&self) -> Result<u32, DatabaseError> {
        let mut guard = self.state.lock().await;
        let state = self.today(&mut guard).await?;
        Ok(self.limit.saturating_sub(state.used))
    }

    pub async fn snapshot(&self) -> Result<QuotaSnapshot, DatabaseError> {
        let mut guard = self.state.lock().await;
        let state = *self.today(&mut guard).await?;
        Ok(QuotaSnapshot {
            day: state.day,
            used: state.used,
            limit: self.limit,
            remaining: self.limit.saturating_sub(state.used),
        })
    }

    /// Operator reset of today's counter.
    pub async fn reset_today(&self) -> Result<(), DatabaseError> {
        let mut guard = self.state.lock().await;
        let state = self.today(&mut guard).await?;
        state.used = 0;
        let day = state.day;
        self.store.save_quota(day, 0, self.limit).await?;
        info!(%day, "Daily quota reset");
        Ok(())
    }

    /// Roll the cached state over to today, loading the stored count on first sight.
    async fn today<'a>(
        &self,
        slot: &'a mut Option<QuotaState>,
    ) -> Result<&'a mut QuotaState, DatabaseError> {
        let day = (self.clock)();
        let stale = slot.is_none_or(|s| s.day != day);
        if stale {
            let used = self.store.load_quota(day).await?.unwrap_or(0);
            *slot = Some(QuotaState { day, used });
        }
        match slot {
            Some(state) => Ok(state),
            None => Err(DatabaseError::Query("quota state missing".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn fixed_clock(current: Arc<std::sync::Mutex<NaiveDate>>) -> DayClock {
        Arc::new(move || *current.lock().unwrap())
    }

    async fn store() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn register_and_derived_views() {
        let today = Arc::new(std::sync::Mutex::new(day(1)));
        let quota = DailyQuota::with_clock(store().await, 5, fixed_clock(today));

        assert!(quota.can_send(5).await.unwrap());
        assert!(!quota.can_send(6).await.unwrap());

        quota.register(3).await.unwrap();
        assert_eq!(quota.used().await.unwrap(), 3);
        assert_eq!(quota.remaining().await.unwrap(), 2);
        assert!(quota.can_send(2).await.unwrap());
        assert!(!quota.can_send(3).await.unwrap());
    }

    #[tokio::test]
    async fn try_reserve_stops_at_limit() {
        let today = Arc::new(std::sync::Mutex::new(day(1)));
        let quota = DailyQuota::with_clock(store().await, 2, fixed_clock(today));

        assert!(quota.try_reserve(1).await.unwrap());
        assert!(quota.try_reserve(1).await.unwrap());
        assert!(!quota.try_reserve(1).await.unwrap());
        assert_eq!(quota.used().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overshoot() {
        let today = Arc::new(std::sync::Mutex::new(day(1)));
        let quota = Arc::new(DailyQuota::with_clock(store().await, 7, fixed_clock(today)));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let quota = quota.clone();
            handles.push(tokio::spawn(async move { quota.try_reserve(1).await.unwrap() }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 7);
        assert_eq!(quota.used().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn rolls_over_at_midnight() {
        let today = Arc::new(std::sync::Mutex::new(day(1)));
        let quota = DailyQuota::with_clock(store().await, 3, fixed_clock(today.clone()));

        quota.register(3).await.unwrap();
        assert!(!quota.can_send(1).await.unwrap());

        *today.lock().unwrap() = day(2);
        assert_eq!(quota.used().await.unwrap(), 0);
        assert!(quota.can_send(3).await.unwrap());

        let snap = quota.snapshot().await.unwrap();
        assert_eq!(snap.day, day(2));
        assert_eq!(snap.remaining, 3);
    }

    #[tokio::test]
    async fn resumes_after_restart() {
        let db = store().await;
        let today = Arc::new(std::sync::Mutex::new(day(1)));

        let first = DailyQuota::with_clock(db.clone(), 10, fixed_clock(today.clone()));
        first.register(4).await.unwrap();
        first.try_reserve(1).await.unwrap();
        drop(first);

        let second = DailyQuota::with_clock(db, 10, fixed_clock(today));
        assert_eq!(second.used().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn reset_today_clears_counter() {
        let db = store().await;
        let today = Arc::new(std::sync::Mutex::new(day(1)));
        let quota = DailyQuota::with_clock(db.clone(), 10, fixed_clock(today));

        quota.register(6).await.unwrap();
        quota.reset_today().await.unwrap();
        assert_eq!(quota.used().await.unwrap(), 0);
        assert_eq!(db.load_quota(day(1)).await.unwrap(), Some(0));
    }
}
