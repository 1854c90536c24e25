//! Strategy, account and subscription repositories

use sqlx::postgres::PgRow;
use sqlx::Row;

use super::{Database, DbError};
use crate::models::{
    Account, Exchange, Id, MarketType, Strategy, StrategyAccount, User,
};

fn strategy_from_row(row: &PgRow) -> Result<Strategy, DbError> {
    let market_type: i16 = row.try_get("market_type")?;
    Ok(Strategy {
        strategy_id: row.try_get("strategy_id")?,
        owner_user_id: row.try_get("owner_user_id")?,
        group_name: row.try_get("group_name")?,
        market_type: MarketType::from_id(market_type)
            .ok_or_else(|| DbError::Corrupt(format!("market_type {}", market_type)))?,
        is_active: row.try_get("is_active")?,
        is_public: row.try_get("is_public")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account, DbError> {
    let exchange: i16 = row.try_get("exchange")?;
    let market_type: i16 = row.try_get("market_type")?;
    Ok(Account {
        account_id: row.try_get("account_id")?,
        owner_user_id: row.try_get("owner_user_id")?,
        display_name: row.try_get("display_name")?,
        exchange: Exchange::from_id(exchange)
            .ok_or_else(|| DbError::Corrupt(format!("exchange {}", exchange)))?,
        market_type: MarketType::from_id(market_type)
            .ok_or_else(|| DbError::Corrupt(format!("market_type {}", market_type)))?,
        is_testnet: row.try_get("is_testnet")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn strategy_account_from_row(row: &PgRow) -> Result<StrategyAccount, DbError> {
    Ok(StrategyAccount {
        strategy_account_id: row.try_get("strategy_account_id")?,
        strategy_id: row.try_get("strategy_id")?,
        account_id: row.try_get("account_id")?,
        weight: row.try_get("weight")?,
        leverage: row.try_get("leverage")?,
        max_symbols: row.try_get("max_symbols")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const STRATEGY_COLS: &str = "strategy_id, owner_user_id, group_name, market_type, is_active, \
     is_public, created_at, updated_at";

const ACCOUNT_COLS: &str = "account_id, owner_user_id, display_name, exchange, market_type, \
     is_testnet, is_active, created_at, updated_at";

const SA_COLS: &str = "strategy_account_id, strategy_id, account_id, weight, leverage, \
     max_symbols, is_active, created_at, updated_at";

/// Strategy repository
pub struct StrategyRepo;

impl StrategyRepo {
    /// Resolve the webhook routing key.
    pub async fn find_by_group_name(
        db: &Database,
        group_name: &str,
    ) -> Result<Option<Strategy>, DbError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM strategies_tb WHERE group_name = $1",
            STRATEGY_COLS
        ))
        .bind(group_name)
        .fetch_optional(db.pool())
        .await?;

        row.map(|r| strategy_from_row(&r)).transpose()
    }

    pub async fn find_by_id(db: &Database, strategy_id: Id) -> Result<Option<Strategy>, DbError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM strategies_tb WHERE strategy_id = $1",
            STRATEGY_COLS
        ))
        .bind(strategy_id)
        .fetch_optional(db.pool())
        .await?;

        row.map(|r| strategy_from_row(&r)).transpose()
    }

    pub async fn is_active(db: &Database, strategy_id: Id) -> Result<bool, DbError> {
        let active = sqlx::query_scalar::<_, bool>(
            "SELECT is_active FROM strategies_tb WHERE strategy_id = $1",
        )
        .bind(strategy_id)
        .fetch_optional(db.pool())
        .await?;
        Ok(active.unwrap_or(false))
    }

    /// Tokens accepted for a webhook naming this strategy: the owner's,
    /// plus - when the strategy is public - every user holding an active
    /// subscription on it.
    pub async fn valid_webhook_tokens(
        db: &Database,
        strategy: &Strategy,
    ) -> Result<Vec<String>, DbError> {
        let mut tokens: Vec<String> = sqlx::query_scalar::<_, String>(
            "SELECT webhook_token FROM users_tb WHERE user_id = $1",
        )
        .bind(strategy.owner_user_id)
        .fetch_all(db.pool())
        .await?;

        if strategy.is_public {
            let subscriber_tokens = sqlx::query_scalar::<_, String>(
                r#"
                SELECT DISTINCT u.webhook_token
                FROM strategy_accounts_tb sa
                JOIN accounts_tb a ON a.account_id = sa.account_id
                JOIN users_tb u ON u.user_id = a.owner_user_id
                WHERE sa.strategy_id = $1 AND sa.is_active = TRUE
                "#,
            )
            .bind(strategy.strategy_id)
            .fetch_all(db.pool())
            .await?;
            tokens.extend(subscriber_tokens);
        }

        Ok(tokens)
    }

    /// SSE permission gate: the owner, or any user with an active
    /// subscription on the strategy.
    pub async fn is_owner_or_active_subscriber(
        db: &Database,
        user_id: Id,
        strategy_id: Id,
    ) -> Result<bool, DbError> {
        let owner = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM strategies_tb WHERE strategy_id = $1 AND owner_user_id = $2",
        )
        .bind(strategy_id)
        .bind(user_id)
        .fetch_one(db.pool())
        .await?;
        if owner > 0 {
            return Ok(true);
        }

        let subscriber = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM strategy_accounts_tb sa
            JOIN accounts_tb a ON a.account_id = sa.account_id
            WHERE sa.strategy_id = $1 AND sa.is_active = TRUE AND a.owner_user_id = $2
            "#,
        )
        .bind(strategy_id)
        .bind(user_id)
        .fetch_one(db.pool())
        .await?;
        Ok(subscriber > 0)
    }

    pub async fn find_user_by_token(
        db: &Database,
        webhook_token: &str,
    ) -> Result<Option<User>, DbError> {
        let row = sqlx::query(
            "SELECT user_id, username, webhook_token, created_at FROM users_tb \
             WHERE webhook_token = $1",
        )
        .bind(webhook_token)
        .fetch_optional(db.pool())
        .await?;

        match row {
            Some(r) => Ok(Some(User {
                user_id: r.try_get("user_id")?,
                username: r.try_get("username")?,
                webhook_token: r.try_get("webhook_token")?,
                created_at: r.try_get("created_at")?,
            })),
            None => Ok(None),
        }
    }
}

/// Exchange account repository
pub struct AccountRepo;

impl AccountRepo {
    pub async fn find_by_id(db: &Database, account_id: Id) -> Result<Option<Account>, DbError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts_tb WHERE account_id = $1",
            ACCOUNT_COLS
        ))
        .bind(account_id)
        .fetch_optional(db.pool())
        .await?;

        row.map(|r| account_from_row(&r)).transpose()
    }

    pub async fn is_active(db: &Database, account_id: Id) -> Result<bool, DbError> {
        let active = sqlx::query_scalar::<_, bool>(
            "SELECT is_active FROM accounts_tb WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(db.pool())
        .await?;
        Ok(active.unwrap_or(false))
    }

    /// Active accounts holding at least one active subscription; the
    /// reconciler's poll cycle walks these.
    pub async fn all_reconcilable(db: &Database) -> Result<Vec<Account>, DbError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT DISTINCT {}
            FROM accounts_tb a
            JOIN strategy_accounts_tb sa ON sa.account_id = a.account_id
            WHERE a.is_active = TRUE AND sa.is_active = TRUE
            "#,
            "a.account_id, a.owner_user_id, a.display_name, a.exchange, a.market_type, \
             a.is_testnet, a.is_active, a.created_at, a.updated_at"
        ))
        .fetch_all(db.pool())
        .await?;
        rows.iter().map(account_from_row).collect()
    }
}

/// StrategyAccount (subscription edge) repository
pub struct StrategyAccountRepo;

/// Aggregate shown by the subscription status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionStatus {
    pub active_positions: i64,
    pub open_orders: i64,
    pub symbols: Vec<String>,
    pub is_active: bool,
}

impl StrategyAccountRepo {
    /// Active subscriptions for a strategy, with their accounts. Only
    /// rows whose account is itself active take part in fan-out.
    pub async fn active_for_strategy(
        db: &Database,
        strategy_id: Id,
    ) -> Result<Vec<(StrategyAccount, Account)>, DbError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {sa_cols},
                   a.account_id AS a_account_id, a.owner_user_id, a.display_name,
                   a.exchange, a.market_type AS a_market_type, a.is_testnet,
                   a.is_active AS a_is_active, a.created_at AS a_created_at,
                   a.updated_at AS a_updated_at
            FROM strategy_accounts_tb sa
            JOIN accounts_tb a ON a.account_id = sa.account_id
            WHERE sa.strategy_id = $1 AND sa.is_active = TRUE AND a.is_active = TRUE
            ORDER BY sa.strategy_account_id
            "#,
            sa_cols = "sa.strategy_account_id, sa.strategy_id, sa.account_id, sa.weight, \
                 sa.leverage, sa.max_symbols, sa.is_active, sa.created_at, sa.updated_at"
        ))
        .bind(strategy_id)
        .fetch_all(db.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let sa = strategy_account_from_row(row)?;
            let exchange: i16 = row.try_get("exchange")?;
            let market_type: i16 = row.try_get("a_market_type")?;
            let account = Account {
                account_id: row.try_get("a_account_id")?,
                owner_user_id: row.try_get("owner_user_id")?,
                display_name: row.try_get("display_name")?,
                exchange: Exchange::from_id(exchange)
                    .ok_or_else(|| DbError::Corrupt(format!("exchange {}", exchange)))?,
                market_type: MarketType::from_id(market_type)
                    .ok_or_else(|| DbError::Corrupt(format!("market_type {}", market_type)))?,
                is_testnet: row.try_get("is_testnet")?,
                is_active: row.try_get("a_is_active")?,
                created_at: row.try_get("a_created_at")?,
                updated_at: row.try_get("a_updated_at")?,
            };
            out.push((sa, account));
        }
        Ok(out)
    }

    pub async fn find(
        db: &Database,
        strategy_id: Id,
        account_id: Id,
    ) -> Result<Option<StrategyAccount>, DbError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM strategy_accounts_tb WHERE strategy_id = $1 AND account_id = $2",
            SA_COLS
        ))
        .bind(strategy_id)
        .bind(account_id)
        .fetch_optional(db.pool())
        .await?;

        row.map(|r| strategy_account_from_row(&r)).transpose()
    }

    pub async fn find_by_id(
        db: &Database,
        strategy_account_id: Id,
    ) -> Result<Option<StrategyAccount>, DbError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM strategy_accounts_tb WHERE strategy_account_id = $1",
            SA_COLS
        ))
        .bind(strategy_account_id)
        .fetch_optional(db.pool())
        .await?;

        row.map(|r| strategy_account_from_row(&r)).transpose()
    }

    /// Point-of-use activity re-check, read fresh from the database
    /// immediately before an exchange call.
    pub async fn is_active(db: &Database, strategy_account_id: Id) -> Result<bool, DbError> {
        let active = sqlx::query_scalar::<_, bool>(
            "SELECT is_active FROM strategy_accounts_tb WHERE strategy_account_id = $1",
        )
        .bind(strategy_account_id)
        .fetch_optional(db.pool())
        .await?;
        Ok(active.unwrap_or(false))
    }

    /// Flip the activity flag. The UPDATE commits before this returns, so
    /// every later point-of-use re-check observes the new value.
    pub async fn set_active(
        db: &Database,
        strategy_account_id: Id,
        active: bool,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE strategy_accounts_tb SET is_active = $1, updated_at = NOW() \
             WHERE strategy_account_id = $2",
        )
        .bind(active)
        .bind(strategy_account_id)
        .execute(db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the subscription edge. Orders, pending orders, trades and
    /// positions cascade at the schema level.
    pub async fn delete(db: &Database, strategy_account_id: Id) -> Result<bool, DbError> {
        let result =
            sqlx::query("DELETE FROM strategy_accounts_tb WHERE strategy_account_id = $1")
                .bind(strategy_account_id)
                .execute(db.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn status_summary(
        db: &Database,
        strategy_account_id: Id,
    ) -> Result<SubscriptionStatus, DbError> {
        let is_active = Self::is_active(db, strategy_account_id).await?;

        let active_positions = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM positions_tb \
             WHERE strategy_account_id = $1 AND quantity <> 0",
        )
        .bind(strategy_account_id)
        .fetch_one(db.pool())
        .await?;

        let open_orders = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM orders_tb \
             WHERE strategy_account_id = $1 AND status IN ({})",
            ui_open_ids()
        ))
        .bind(strategy_account_id)
        .fetch_one(db.pool())
        .await?;

        let mut symbols = sqlx::query_scalar::<_, String>(&format!(
            r#"
            SELECT DISTINCT symbol FROM (
                SELECT symbol FROM positions_tb
                WHERE strategy_account_id = $1 AND quantity <> 0
                UNION ALL
                SELECT symbol FROM orders_tb
                WHERE strategy_account_id = $1 AND status IN ({})
            ) s
            "#,
            active_ids()
        ))
        .bind(strategy_account_id)
        .fetch_all(db.pool())
        .await?;
        symbols.sort();

        Ok(SubscriptionStatus {
            active_positions,
            open_orders,
            symbols,
            is_active,
        })
    }
}

pub(crate) fn ui_open_ids() -> String {
    crate::models::OrderStatus::UI_OPEN
        .iter()
        .map(|s| s.id().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn active_ids() -> String {
    crate::models::OrderStatus::ACTIVE
        .iter()
        .map(|s| s.id().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_id_lists() {
        assert_eq!(ui_open_ids(), "1, 2, 3");
        assert_eq!(active_ids(), "0, 1, 2, 3, 4");
    }
}
