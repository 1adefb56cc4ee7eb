//! Daily provider quota ledger
//!
//! One row per provider per UTC calendar date. Reset is implicit: a new
//! date has no row yet, so usage starts at zero. The check-then-increment
//! is a single guarded UPDATE so two concurrent callers cannot both pass
//! the check and jointly overshoot the ceiling.

use chrono::Utc;
use shelfmark_common::Result;
use sqlx::SqlitePool;

use crate::models::ProviderKind;

/// Today's ledger key. Recomputed on every call; the process may stay
/// alive past midnight.
fn today_utc() -> String {
    Utc::now().date_naive().to_string()
}

/// Try to consume `n` units of today's quota.
///
/// Returns `false` (with no mutation) when the remaining quota is
/// insufficient; otherwise records the usage and returns `true`.
pub async fn use_quota(
    pool: &SqlitePool,
    provider: ProviderKind,
    n: i64,
    ceiling: i64,
) -> Result<bool> {
    use_quota_on_date(pool, provider, &today_utc(), n, ceiling).await
}

/// Date-explicit variant of [`use_quota`], used directly by tests
pub async fn use_quota_on_date(
    pool: &SqlitePool,
    provider: ProviderKind,
    date: &str,
    n: i64,
    ceiling: i64,
) -> Result<bool> {
    sqlx::query(
        "INSERT OR IGNORE INTO provider_quota (provider, date, used, ceiling) VALUES (?, ?, 0, ?)",
    )
    .bind(provider.as_str())
    .bind(date)
    .bind(ceiling)
    .execute(pool)
    .await?;

    let result = sqlx::query(
        "UPDATE provider_quota SET used = used + ?1 \
         WHERE provider = ?2 AND date = ?3 AND used + ?1 <= ceiling",
    )
    .bind(n)
    .bind(provider.as_str())
    .bind(date)
    .execute(pool)
    .await?;

    let granted = result.rows_affected() == 1;
    if !granted {
        tracing::debug!(
            provider = %provider,
            requested = n,
            "Quota request denied"
        );
    }

    Ok(granted)
}

/// Units left today. A provider with no row yet has its full ceiling.
pub async fn remaining(pool: &SqlitePool, provider: ProviderKind, ceiling: i64) -> Result<i64> {
    remaining_on_date(pool, provider, &today_utc(), ceiling).await
}

async fn remaining_on_date(
    pool: &SqlitePool,
    provider: ProviderKind,
    date: &str,
    ceiling: i64,
) -> Result<i64> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT used, ceiling FROM provider_quota WHERE provider = ? AND date = ?",
    )
    .bind(provider.as_str())
    .bind(date)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some((used, stored_ceiling)) => (stored_ceiling - used).max(0),
        None => ceiling,
    })
}

/// Whether today's quota is used up
pub async fn exhausted(pool: &SqlitePool, provider: ProviderKind, ceiling: i64) -> Result<bool> {
    Ok(remaining(pool, provider, ceiling).await? <= 0)
}

/// Maintenance pass: drop ledger rows older than `keep_days`
pub async fn prune_old(pool: &SqlitePool, keep_days: i64) -> Result<u64> {
    let cutoff = (Utc::now().date_naive() - chrono::Duration::days(keep_days)).to_string();

    let result = sqlx::query("DELETE FROM provider_quota WHERE date < ?")
        .bind(&cutoff)
        .execute(pool)
        .await?;

    let pruned = result.rows_affected();
    if pruned > 0 {
        tracing::info!(pruned, cutoff = %cutoff, "Pruned old quota records");
    }

    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_use_within_ceiling() {
        let pool = test_pool().await;

        assert!(use_quota(&pool, ProviderKind::GoogleBooks, 400, 1000)
            .await
            .unwrap());
        assert!(use_quota(&pool, ProviderKind::GoogleBooks, 600, 1000)
            .await
            .unwrap());
        assert_eq!(
            remaining(&pool, ProviderKind::GoogleBooks, 1000).await.unwrap(),
            0
        );
        assert!(exhausted(&pool, ProviderKind::GoogleBooks, 1000)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_deny_leaves_counter_unchanged() {
        let pool = test_pool().await;

        assert!(use_quota(&pool, ProviderKind::GoogleBooks, 900, 1000)
            .await
            .unwrap());
        // Would overshoot: denied, nothing recorded
        assert!(!use_quota(&pool, ProviderKind::GoogleBooks, 200, 1000)
            .await
            .unwrap());
        assert_eq!(
            remaining(&pool, ProviderKind::GoogleBooks, 1000).await.unwrap(),
            100
        );
    }

    #[tokio::test]
    async fn test_dates_are_isolated() {
        let pool = test_pool().await;

        assert!(
            use_quota_on_date(&pool, ProviderKind::GoogleBooks, "2026-08-03", 1000, 1000)
                .await
                .unwrap()
        );
        // Next day starts fresh
        assert!(
            use_quota_on_date(&pool, ProviderKind::GoogleBooks, "2026-08-04", 1, 1000)
                .await
                .unwrap()
        );
        assert_eq!(
            remaining_on_date(&pool, ProviderKind::GoogleBooks, "2026-08-04", 1000)
                .await
                .unwrap(),
            999
        );
    }

    #[tokio::test]
    async fn test_providers_are_isolated() {
        let pool = test_pool().await;

        assert!(use_quota(&pool, ProviderKind::GoogleBooks, 1000, 1000)
            .await
            .unwrap());
        assert_eq!(
            remaining(&pool, ProviderKind::OpenLibrary, 500).await.unwrap(),
            500
        );
    }

    #[tokio::test]
    async fn test_prune_removes_only_old_rows() {
        let pool = test_pool().await;

        use_quota_on_date(&pool, ProviderKind::GoogleBooks, "2020-01-01", 5, 1000)
            .await
            .unwrap();
        use_quota(&pool, ProviderKind::GoogleBooks, 5, 1000)
            .await
            .unwrap();

        let pruned = prune_old(&pool, 7).await.unwrap();
        assert_eq!(pruned, 1);
        // Today's row survives
        assert_eq!(
            remaining(&pool, ProviderKind::GoogleBooks, 1000).await.unwrap(),
            995
        );
    }
}
