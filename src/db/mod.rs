//! Entity store contract, connection pool and migrations.
//!
//! This module provides:
//! - `EntityStore`: non-transactional finds and updates, plus `begin()`
//! - `StoreTransaction`: reads and writes scoped to one store transaction
//! - PostgreSQL pool creation and migration helpers
//!
//! # Transaction Scope
//!
//! Every balance write goes through a `StoreTransaction`. Dropping one
//! without calling `commit` rolls it back, so a `?` anywhere between
//! `begin` and `commit` leaves no partial mutation behind.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{
        card::{Card, CardProfilePatch, CardStatus, CardUser},
        ledger::{
            CardTransaction, CardTransactionPatch, DepositAddress, MainTransaction,
            MainTransactionPatch, NewCardTransaction, NewMainTransaction,
        },
    },
};

/// Type alias for PostgreSQL connection pool.
pub type DbPool = Pool<Postgres>;

/// Persistence for cards, card-users and both ledgers.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Open a store transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Connectivity check used by the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn find_card_by_provider_ref(&self, provider_ref: &str)
    -> Result<Option<Card>, StoreError>;

    /// Most recent active card of a card-user, else most recent non-canceled one.
    async fn find_primary_card(&self, card_user_id: Uuid) -> Result<Option<Card>, StoreError>;

    async fn find_card_user_by_id(&self, id: Uuid) -> Result<Option<CardUser>, StoreError>;

    async fn find_card_user_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<CardUser>, StoreError>;

    async fn find_card_user_by_user_id(&self, user_id: Uuid)
    -> Result<Option<CardUser>, StoreError>;

    async fn find_card_transaction_by_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<CardTransaction>, StoreError>;

    /// Address comparison is case-insensitive.
    async fn find_deposit_address(
        &self,
        chain_id: i64,
        address: &str,
    ) -> Result<Option<DepositAddress>, StoreError>;

    async fn upsert_deposit_address(
        &self,
        user_id: Uuid,
        chain_id: i64,
        address: &str,
    ) -> Result<DepositAddress, StoreError>;

    async fn update_card_profile(
        &self,
        card_id: Uuid,
        patch: &CardProfilePatch,
    ) -> Result<Option<Card>, StoreError>;

    async fn update_card_user_status(
        &self,
        card_user_id: Uuid,
        status: &str,
    ) -> Result<Option<CardUser>, StoreError>;

    /// Mark a line's fee as accounted for.
    async fn mark_fee_settled(
        &self,
        card_transaction_id: Uuid,
        fee_provider_ref: Option<&str>,
    ) -> Result<Option<CardTransaction>, StoreError>;

    /// Successful or declined lines with `fee > 0` and `fee_settled = false`, oldest first.
    async fn find_unsettled_fees(&self, limit: i64) -> Result<Vec<CardTransaction>, StoreError>;
}

/// Operations scoped to one store transaction.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read a card and hold its row until commit or rollback.
    ///
    /// A concurrent transaction reading the same card waits, then sees the
    /// committed balance. Callers lock the card before its card-user.
    async fn card_by_id(&mut self, id: Uuid) -> Result<Option<Card>, StoreError>;

    /// Read a card-user and hold its row until commit or rollback.
    async fn card_user_by_id(&mut self, id: Uuid) -> Result<Option<CardUser>, StoreError>;

    async fn card_transaction_by_ref(
        &mut self,
        provider_ref: &str,
    ) -> Result<Option<CardTransaction>, StoreError>;

    async fn main_transaction_by_ref(
        &mut self,
        reference: &str,
    ) -> Result<Option<MainTransaction>, StoreError>;

    /// Set the card balance, optionally resetting its decline counter in the same write.
    async fn update_card_balance(
        &mut self,
        card_id: Uuid,
        balance: i64,
        reset_decline_count: bool,
    ) -> Result<Option<Card>, StoreError>;

    async fn update_card_user_balance(
        &mut self,
        card_user_id: Uuid,
        balance: i64,
    ) -> Result<Option<CardUser>, StoreError>;

    async fn increment_decline_count(&mut self, card_id: Uuid) -> Result<Option<Card>, StoreError>;

    async fn update_card_status(
        &mut self,
        card_id: Uuid,
        status: CardStatus,
    ) -> Result<Option<Card>, StoreError>;

    async fn create_card_transaction(
        &mut self,
        line: NewCardTransaction,
    ) -> Result<CardTransaction, StoreError>;

    async fn update_card_transaction(
        &mut self,
        id: Uuid,
        patch: &CardTransactionPatch,
    ) -> Result<Option<CardTransaction>, StoreError>;

    async fn create_main_transaction(
        &mut self,
        entry: NewMainTransaction,
    ) -> Result<MainTransaction, StoreError>;

    async fn update_main_transaction(
        &mut self,
        id: Uuid,
        patch: &MainTransactionPatch,
    ) -> Result<Option<MainTransaction>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Create a new PostgreSQL connection pool.
///
/// # Configuration
///
/// - Maximum connections: 10 (the advisory lock backend holds one per in-flight mutation)
/// - Connections are created lazily as needed
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Run database migrations from the `migrations/` directory.
///
/// Migrations are tracked in the `_sqlx_migrations` table, so each runs only once.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
