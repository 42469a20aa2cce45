//! PostgreSQL implementation of the entity store.
//!
//! Status and kind columns are stored as TEXT. Rows are read into
//! `*Row` structs and converted into the domain models, so an unknown
//! value surfaces as `StoreError::CorruptRow` instead of a silent default.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, postgres::PgExecutor};
use uuid::Uuid;

use super::{DbPool, EntityStore, StoreTransaction};
use crate::{
    error::StoreError,
    models::{
        card::{Card, CardProfilePatch, CardStatus, CardUser},
        ledger::{
            CardTransaction, CardTransactionPatch, DepositAddress, MainTransaction,
            MainTransactionPatch, MerchantInfo, NewCardTransaction, NewMainTransaction,
        },
    },
};

#[derive(Debug, FromRow)]
struct CardRow {
    id: Uuid,
    user_id: Uuid,
    card_user_id: Uuid,
    provider_ref: String,
    status: String,
    balance: i64,
    spending_limit: Option<i64>,
    limit_frequency: Option<String>,
    is_frozen: bool,
    insufficient_funds_decline_count: i32,
    expiration_month: Option<i16>,
    expiration_year: Option<i16>,
    last_four: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CardRow> for Card {
    type Error = StoreError;

    fn try_from(row: CardRow) -> Result<Self, Self::Error> {
        Ok(Card {
            id: row.id,
            user_id: row.user_id,
            card_user_id: row.card_user_id,
            provider_ref: row.provider_ref,
            status: row.status.parse().map_err(|detail| corrupt("cards", detail))?,
            balance: row.balance,
            spending_limit: row.spending_limit,
            limit_frequency: row.limit_frequency,
            is_frozen: row.is_frozen,
            insufficient_funds_decline_count: row.insufficient_funds_decline_count,
            expiration_month: row.expiration_month,
            expiration_year: row.expiration_year,
            last_four: row.last_four,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CardUserRow {
    id: Uuid,
    user_id: Uuid,
    provider_ref: String,
    status: String,
    balance: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CardUserRow> for CardUser {
    fn from(row: CardUserRow) -> Self {
        CardUser {
            id: row.id,
            user_id: row.user_id,
            provider_ref: row.provider_ref,
            status: row.status,
            balance: row.balance,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct CardTransactionRow {
    id: Uuid,
    card_id: Uuid,
    card_user_id: Uuid,
    user_id: Uuid,
    provider_ref: String,
    kind: String,
    status: String,
    amount: i64,
    fee: i64,
    currency: String,
    balance_before: Option<i64>,
    balance_after: Option<i64>,
    merchant_name: Option<String>,
    merchant_city: Option<String>,
    merchant_country: Option<String>,
    merchant_category: Option<String>,
    merchant_category_code: Option<String>,
    decline_reason: Option<String>,
    fee_provider_ref: Option<String>,
    fee_settled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CardTransactionRow> for CardTransaction {
    type Error = StoreError;

    fn try_from(row: CardTransactionRow) -> Result<Self, Self::Error> {
        Ok(CardTransaction {
            id: row.id,
            card_id: row.card_id,
            card_user_id: row.card_user_id,
            user_id: row.user_id,
            provider_ref: row.provider_ref,
            kind: row
                .kind
                .parse()
                .map_err(|detail| corrupt("card_transactions", detail))?,
            status: row
                .status
                .parse()
                .map_err(|detail| corrupt("card_transactions", detail))?,
            amount: row.amount,
            fee: row.fee,
            currency: row.currency,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            merchant: MerchantInfo {
                name: row.merchant_name,
                city: row.merchant_city,
                country: row.merchant_country,
                category: row.merchant_category,
                category_code: row.merchant_category_code,
            },
            decline_reason: row.decline_reason,
            fee_provider_ref: row.fee_provider_ref,
            fee_settled: row.fee_settled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MainTransactionRow {
    id: Uuid,
    user_id: Uuid,
    reference: String,
    kind: String,
    status: String,
    amount: i64,
    fee: i64,
    currency: String,
    balance_before: Option<i64>,
    balance_after: Option<i64>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MainTransactionRow> for MainTransaction {
    type Error = StoreError;

    fn try_from(row: MainTransactionRow) -> Result<Self, Self::Error> {
        Ok(MainTransaction {
            id: row.id,
            user_id: row.user_id,
            reference: row.reference,
            kind: row
                .kind
                .parse()
                .map_err(|detail| corrupt("main_transactions", detail))?,
            status: row
                .status
                .parse()
                .map_err(|detail| corrupt("main_transactions", detail))?,
            amount: row.amount,
            fee: row.fee,
            currency: row.currency,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DepositAddressRow {
    id: Uuid,
    user_id: Uuid,
    chain_id: i64,
    address: String,
    created_at: DateTime<Utc>,
}

impl From<DepositAddressRow> for DepositAddress {
    fn from(row: DepositAddressRow) -> Self {
        DepositAddress {
            id: row.id,
            user_id: row.user_id,
            chain_id: row.chain_id,
            address: row.address,
            created_at: row.created_at,
        }
    }
}

fn corrupt(table: &'static str, detail: String) -> StoreError {
    StoreError::CorruptRow { table, detail }
}

// Queries shared by the pool-backed store and the transaction handle.

async fn card_user_by_id<'e, E: PgExecutor<'e>>(
    executor: E,
    id: Uuid,
) -> Result<Option<CardUser>, StoreError> {
    let row = sqlx::query_as::<_, CardUserRow>("SELECT * FROM card_users WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(row.map(CardUser::from))
}

async fn card_transaction_by_ref<'e, E: PgExecutor<'e>>(
    executor: E,
    provider_ref: &str,
) -> Result<Option<CardTransaction>, StoreError> {
    sqlx::query_as::<_, CardTransactionRow>(
        "SELECT * FROM card_transactions WHERE provider_ref = $1",
    )
    .bind(provider_ref)
    .fetch_optional(executor)
    .await?
    .map(CardTransaction::try_from)
    .transpose()
}

/// PostgreSQL-backed `EntityStore`.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTransaction { tx }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_card_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<Card>, StoreError> {
        sqlx::query_as::<_, CardRow>("SELECT * FROM cards WHERE provider_ref = $1")
            .bind(provider_ref)
            .fetch_optional(&self.pool)
            .await?
            .map(Card::try_from)
            .transpose()
    }

    async fn find_primary_card(&self, card_user_id: Uuid) -> Result<Option<Card>, StoreError> {
        sqlx::query_as::<_, CardRow>(
            r#"
            SELECT * FROM cards
            WHERE card_user_id = $1 AND status <> 'canceled'
            ORDER BY (status = 'active') DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(card_user_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Card::try_from)
        .transpose()
    }

    async fn find_card_user_by_id(&self, id: Uuid) -> Result<Option<CardUser>, StoreError> {
        card_user_by_id(&self.pool, id).await
    }

    async fn find_card_user_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<CardUser>, StoreError> {
        let row =
            sqlx::query_as::<_, CardUserRow>("SELECT * FROM card_users WHERE provider_ref = $1")
                .bind(provider_ref)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(CardUser::from))
    }

    async fn find_card_user_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<CardUser>, StoreError> {
        let row = sqlx::query_as::<_, CardUserRow>("SELECT * FROM card_users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(CardUser::from))
    }

    async fn find_card_transaction_by_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<CardTransaction>, StoreError> {
        card_transaction_by_ref(&self.pool, provider_ref).await
    }

    async fn find_deposit_address(
        &self,
        chain_id: i64,
        address: &str,
    ) -> Result<Option<DepositAddress>, StoreError> {
        let row = sqlx::query_as::<_, DepositAddressRow>(
            "SELECT * FROM deposit_addresses WHERE chain_id = $1 AND lower(address) = lower($2)",
        )
        .bind(chain_id)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DepositAddress::from))
    }

    async fn upsert_deposit_address(
        &self,
        user_id: Uuid,
        chain_id: i64,
        address: &str,
    ) -> Result<DepositAddress, StoreError> {
        let row = sqlx::query_as::<_, DepositAddressRow>(
            r#"
            INSERT INTO deposit_addresses (user_id, chain_id, address)
            VALUES ($1, $2, $3)
            ON CONFLICT (chain_id, (lower(address)))
            DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(chain_id)
        .bind(address)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn update_card_profile(
        &self,
        card_id: Uuid,
        patch: &CardProfilePatch,
    ) -> Result<Option<Card>, StoreError> {
        sqlx::query_as::<_, CardRow>(
            r#"
            UPDATE cards
            SET status = COALESCE($2, status),
                is_frozen = COALESCE($3, is_frozen),
                spending_limit = COALESCE($4, spending_limit),
                limit_frequency = COALESCE($5, limit_frequency),
                expiration_month = COALESCE($6, expiration_month),
                expiration_year = COALESCE($7, expiration_year),
                last_four = COALESCE($8, last_four),
                insufficient_funds_decline_count =
                    CASE WHEN $9 THEN 0 ELSE insufficient_funds_decline_count END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(card_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.is_frozen)
        .bind(patch.spending_limit)
        .bind(patch.limit_frequency.as_deref())
        .bind(patch.expiration_month)
        .bind(patch.expiration_year)
        .bind(patch.last_four.as_deref())
        .bind(patch.reset_decline_count)
        .fetch_optional(&self.pool)
        .await?
        .map(Card::try_from)
        .transpose()
    }

    async fn update_card_user_status(
        &self,
        card_user_id: Uuid,
        status: &str,
    ) -> Result<Option<CardUser>, StoreError> {
        let row = sqlx::query_as::<_, CardUserRow>(
            "UPDATE card_users SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(card_user_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CardUser::from))
    }

    async fn mark_fee_settled(
        &self,
        card_transaction_id: Uuid,
        fee_provider_ref: Option<&str>,
    ) -> Result<Option<CardTransaction>, StoreError> {
        sqlx::query_as::<_, CardTransactionRow>(
            r#"
            UPDATE card_transactions
            SET fee_settled = TRUE,
                fee_provider_ref = COALESCE($2, fee_provider_ref),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(card_transaction_id)
        .bind(fee_provider_ref)
        .fetch_optional(&self.pool)
        .await?
        .map(CardTransaction::try_from)
        .transpose()
    }

    async fn find_unsettled_fees(&self, limit: i64) -> Result<Vec<CardTransaction>, StoreError> {
        sqlx::query_as::<_, CardTransactionRow>(
            r#"
            SELECT * FROM card_transactions
            WHERE fee > 0 AND fee_settled = FALSE AND status IN ('successful', 'declined')
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(CardTransaction::try_from)
        .collect()
    }
}

/// Store transaction backed by a `sqlx::Transaction`.
///
/// sqlx rolls the transaction back when it is dropped uncommitted.
pub struct PgStoreTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn card_by_id(&mut self, id: Uuid) -> Result<Option<Card>, StoreError> {
        // FOR UPDATE holds the row until commit, so concurrent mutations of
        // the same card read the balance only after this one has committed
        sqlx::query_as::<_, CardRow>("SELECT * FROM cards WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Card::try_from)
            .transpose()
    }

    async fn card_user_by_id(&mut self, id: Uuid) -> Result<Option<CardUser>, StoreError> {
        let row =
            sqlx::query_as::<_, CardUserRow>("SELECT * FROM card_users WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;

        Ok(row.map(CardUser::from))
    }

    async fn card_transaction_by_ref(
        &mut self,
        provider_ref: &str,
    ) -> Result<Option<CardTransaction>, StoreError> {
        card_transaction_by_ref(&mut *self.tx, provider_ref).await
    }

    async fn main_transaction_by_ref(
        &mut self,
        reference: &str,
    ) -> Result<Option<MainTransaction>, StoreError> {
        sqlx::query_as::<_, MainTransactionRow>(
            "SELECT * FROM main_transactions WHERE reference = $1",
        )
        .bind(reference)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(MainTransaction::try_from)
        .transpose()
    }

    async fn update_card_balance(
        &mut self,
        card_id: Uuid,
        balance: i64,
        reset_decline_count: bool,
    ) -> Result<Option<Card>, StoreError> {
        sqlx::query_as::<_, CardRow>(
            r#"
            UPDATE cards
            SET balance = $2,
                insufficient_funds_decline_count =
                    CASE WHEN $3 THEN 0 ELSE insufficient_funds_decline_count END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(card_id)
        .bind(balance)
        .bind(reset_decline_count)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Card::try_from)
        .transpose()
    }

    async fn update_card_user_balance(
        &mut self,
        card_user_id: Uuid,
        balance: i64,
    ) -> Result<Option<CardUser>, StoreError> {
        let row = sqlx::query_as::<_, CardUserRow>(
            "UPDATE card_users SET balance = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(card_user_id)
        .bind(balance)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(CardUser::from))
    }

    async fn increment_decline_count(&mut self, card_id: Uuid) -> Result<Option<Card>, StoreError> {
        sqlx::query_as::<_, CardRow>(
            r#"
            UPDATE cards
            SET insufficient_funds_decline_count = insufficient_funds_decline_count + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(card_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Card::try_from)
        .transpose()
    }

    async fn update_card_status(
        &mut self,
        card_id: Uuid,
        status: CardStatus,
    ) -> Result<Option<Card>, StoreError> {
        sqlx::query_as::<_, CardRow>(
            "UPDATE cards SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(card_id)
        .bind(status.as_str())
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Card::try_from)
        .transpose()
    }

    async fn create_card_transaction(
        &mut self,
        line: NewCardTransaction,
    ) -> Result<CardTransaction, StoreError> {
        let row = sqlx::query_as::<_, CardTransactionRow>(
            r#"
            INSERT INTO card_transactions (
                card_id, card_user_id, user_id, provider_ref, kind, status,
                amount, fee, currency, balance_before, balance_after,
                merchant_name, merchant_city, merchant_country,
                merchant_category, merchant_category_code,
                decline_reason, fee_settled
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING *
            "#,
        )
        .bind(line.card_id)
        .bind(line.card_user_id)
        .bind(line.user_id)
        .bind(&line.provider_ref)
        .bind(line.kind.as_str())
        .bind(line.status.as_str())
        .bind(line.amount)
        .bind(line.fee)
        .bind(&line.currency)
        .bind(line.balance_before)
        .bind(line.balance_after)
        .bind(line.merchant.name)
        .bind(line.merchant.city)
        .bind(line.merchant.country)
        .bind(line.merchant.category)
        .bind(line.merchant.category_code)
        .bind(line.decline_reason)
        .bind(line.fee_settled)
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }

    async fn update_card_transaction(
        &mut self,
        id: Uuid,
        patch: &CardTransactionPatch,
    ) -> Result<Option<CardTransaction>, StoreError> {
        sqlx::query_as::<_, CardTransactionRow>(
            r#"
            UPDATE card_transactions
            SET status = COALESCE($2, status),
                amount = COALESCE($3, amount),
                fee = COALESCE($4, fee),
                balance_before = COALESCE($5, balance_before),
                balance_after = COALESCE($6, balance_after),
                decline_reason = COALESCE($7, decline_reason),
                fee_settled = COALESCE($8, fee_settled),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.amount)
        .bind(patch.fee)
        .bind(patch.balance_before)
        .bind(patch.balance_after)
        .bind(patch.decline_reason.as_deref())
        .bind(patch.fee_settled)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(CardTransaction::try_from)
        .transpose()
    }

    async fn create_main_transaction(
        &mut self,
        entry: NewMainTransaction,
    ) -> Result<MainTransaction, StoreError> {
        let row = sqlx::query_as::<_, MainTransactionRow>(
            r#"
            INSERT INTO main_transactions (
                user_id, reference, kind, status, amount, fee, currency,
                balance_before, balance_after, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(entry.user_id)
        .bind(&entry.reference)
        .bind(entry.kind.as_str())
        .bind(entry.status.as_str())
        .bind(entry.amount)
        .bind(entry.fee)
        .bind(&entry.currency)
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(entry.metadata)
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }

    async fn update_main_transaction(
        &mut self,
        id: Uuid,
        patch: &MainTransactionPatch,
    ) -> Result<Option<MainTransaction>, StoreError> {
        sqlx::query_as::<_, MainTransactionRow>(
            r#"
            UPDATE main_transactions
            SET status = COALESCE($2, status),
                amount = COALESCE($3, amount),
                fee = COALESCE($4, fee),
                balance_before = COALESCE($5, balance_before),
                balance_after = COALESCE($6, balance_after),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.amount)
        .bind(patch.fee)
        .bind(patch.balance_before)
        .bind(patch.balance_after)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(MainTransaction::try_from)
        .transpose()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
