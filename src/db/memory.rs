//! In-memory entity store for tests.
//!
//! Transactions run concurrently the way they do on PostgreSQL under READ
//! COMMITTED:
//! - reads see committed rows plus the transaction's own writes
//! - `card_by_id`, `card_user_by_id` and every card or card-user write take
//!   a row lock held until the transaction ends, like `FOR UPDATE`
//! - writes are buffered and applied on `commit`; dropping discards them

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{EntityStore, StoreTransaction};
use crate::{
    error::StoreError,
    models::{
        card::{Card, CardProfilePatch, CardStatus, CardUser},
        ledger::{
            CardTransaction, CardTransactionPatch, CardTransactionStatus, DepositAddress, MainTransaction,
            MainTransactionPatch, NewCardTransaction, NewMainTransaction,
        },
    },
};

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub cards: HashMap<Uuid, Card>,
    pub card_users: HashMap<Uuid, CardUser>,
    pub card_transactions: HashMap<Uuid, CardTransaction>,
    pub main_transactions: HashMap<Uuid, MainTransaction>,
    pub deposit_addresses: HashMap<Uuid, DepositAddress>,

    /// Added to every card balance write, to exercise read-back verification
    pub card_balance_write_skew: i64,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    row_locks: Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of one card or card-user row.
    async fn lock_row(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let row = {
            let mut rows = self
                .row_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            rows.entry(id).or_default().clone()
        };
        row.lock_owned().await
    }

    pub async fn insert_card_user(&self, card_user: CardUser) {
        self.tables
            .lock()
            .await
            .card_users
            .insert(card_user.id, card_user);
    }

    pub async fn insert_card(&self, card: Card) {
        self.tables.lock().await.cards.insert(card.id, card);
    }

    pub async fn card(&self, id: Uuid) -> Option<Card> {
        self.tables.lock().await.cards.get(&id).cloned()
    }

    pub async fn card_user(&self, id: Uuid) -> Option<CardUser> {
        self.tables.lock().await.card_users.get(&id).cloned()
    }

    pub async fn card_transaction(&self, provider_ref: &str) -> Option<CardTransaction> {
        self.tables
            .lock()
            .await
            .card_transactions
            .values()
            .find(|line| line.provider_ref == provider_ref)
            .cloned()
    }

    pub async fn main_transaction(&self, reference: &str) -> Option<MainTransaction> {
        self.tables
            .lock()
            .await
            .main_transactions
            .values()
            .find(|entry| entry.reference == reference)
            .cloned()
    }

    pub async fn card_transaction_count(&self) -> usize {
        self.tables.lock().await.card_transactions.len()
    }

    pub async fn set_card_balance_write_skew(&self, skew: i64) {
        self.tables.lock().await.card_balance_write_skew = skew;
    }
}

fn find_card_user_where(
    tables: &Tables,
    predicate: impl Fn(&CardUser) -> bool,
) -> Option<CardUser> {
    tables.card_users.values().find(|u| predicate(u)).cloned()
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            row_guards: HashMap::new(),
            writes: Tables::default(),
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_card_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<Card>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .cards
            .values()
            .find(|card| card.provider_ref == provider_ref)
            .cloned())
    }

    async fn find_primary_card(&self, card_user_id: Uuid) -> Result<Option<Card>, StoreError> {
        let tables = self.tables.lock().await;
        let mut candidates: Vec<&Card> = tables
            .cards
            .values()
            .filter(|card| card.card_user_id == card_user_id)
            .filter(|card| card.status != CardStatus::Canceled)
            .collect();
        candidates.sort_by_key(|card| {
            (
                card.status == CardStatus::Active,
                card.created_at,
            )
        });
        Ok(candidates.last().map(|card| (*card).clone()))
    }

    async fn find_card_user_by_id(&self, id: Uuid) -> Result<Option<CardUser>, StoreError> {
        Ok(self.tables.lock().await.card_users.get(&id).cloned())
    }

    async fn find_card_user_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<CardUser>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(find_card_user_where(&tables, |u| u.provider_ref == provider_ref))
    }

    async fn find_card_user_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<CardUser>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(find_card_user_where(&tables, |u| u.user_id == user_id))
    }

    async fn find_card_transaction_by_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<CardTransaction>, StoreError> {
        Ok(self.card_transaction(provider_ref).await)
    }

    async fn find_deposit_address(
        &self,
        chain_id: i64,
        address: &str,
    ) -> Result<Option<DepositAddress>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .deposit_addresses
            .values()
            .find(|a| a.chain_id == chain_id && a.address.eq_ignore_ascii_case(address))
            .cloned())
    }

    async fn upsert_deposit_address(
        &self,
        user_id: Uuid,
        chain_id: i64,
        address: &str,
    ) -> Result<DepositAddress, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .deposit_addresses
            .values_mut()
            .find(|a| a.chain_id == chain_id && a.address.eq_ignore_ascii_case(address))
        {
            existing.user_id = user_id;
            return Ok(existing.clone());
        }

        let record = DepositAddress {
            id: Uuid::new_v4(),
            user_id,
            chain_id,
            address: address.to_string(),
            created_at: Utc::now(),
        };
        tables.deposit_addresses.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_card_profile(
        &self,
        card_id: Uuid,
        patch: &CardProfilePatch,
    ) -> Result<Option<Card>, StoreError> {
        let _row = self.lock_row(card_id).await;
        let mut tables = self.tables.lock().await;
        let Some(card) = tables.cards.get_mut(&card_id) else {
            return Ok(None);
        };
        if let Some(status) = patch.status {
            card.status = status;
        }
        if let Some(is_frozen) = patch.is_frozen {
            card.is_frozen = is_frozen;
        }
        if let Some(limit) = patch.spending_limit {
            card.spending_limit = Some(limit);
        }
        if let Some(frequency) = &patch.limit_frequency {
            card.limit_frequency = Some(frequency.clone());
        }
        if let Some(month) = patch.expiration_month {
            card.expiration_month = Some(month);
        }
        if let Some(year) = patch.expiration_year {
            card.expiration_year = Some(year);
        }
        if let Some(last_four) = &patch.last_four {
            card.last_four = Some(last_four.clone());
        }
        if patch.reset_decline_count {
            card.insufficient_funds_decline_count = 0;
        }
        card.updated_at = Utc::now();
        Ok(Some(card.clone()))
    }

    async fn update_card_user_status(
        &self,
        card_user_id: Uuid,
        status: &str,
    ) -> Result<Option<CardUser>, StoreError> {
        let _row = self.lock_row(card_user_id).await;
        let mut tables = self.tables.lock().await;
        Ok(tables.card_users.get_mut(&card_user_id).map(|user| {
            user.status = status.to_string();
            user.updated_at = Utc::now();
            user.clone()
        }))
    }

    async fn mark_fee_settled(
        &self,
        card_transaction_id: Uuid,
        fee_provider_ref: Option<&str>,
    ) -> Result<Option<CardTransaction>, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .card_transactions
            .get_mut(&card_transaction_id)
            .map(|line| {
                line.fee_settled = true;
                if let Some(reference) = fee_provider_ref {
                    line.fee_provider_ref = Some(reference.to_string());
                }
                line.updated_at = Utc::now();
                line.clone()
            }))
    }

    async fn find_unsettled_fees(&self, limit: i64) -> Result<Vec<CardTransaction>, StoreError> {
        let tables = self.tables.lock().await;
        let mut lines: Vec<CardTransaction> = tables
            .card_transactions
            .values()
            .filter(|line| line.fee > 0 && !line.fee_settled)
            .filter(|line| {
                matches!(
                    line.status,
                    CardTransactionStatus::Successful | CardTransactionStatus::Declined
                )
            })
            .cloned()
            .collect();
        lines.sort_by_key(|line| line.created_at);
        lines.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(lines)
    }
}

pub struct MemoryTransaction {
    store: MemoryStore,
    row_guards: HashMap<Uuid, OwnedMutexGuard<()>>,

    /// Rows written by this transaction, applied on commit
    writes: Tables,
}

impl MemoryTransaction {
    async fn lock_row(&mut self, id: Uuid) {
        if !self.row_guards.contains_key(&id) {
            let guard = self.store.lock_row(id).await;
            self.row_guards.insert(id, guard);
        }
    }

    async fn current_card(&self, id: Uuid) -> Option<Card> {
        match self.writes.cards.get(&id) {
            Some(card) => Some(card.clone()),
            None => self.store.tables.lock().await.cards.get(&id).cloned(),
        }
    }

    async fn current_card_user(&self, id: Uuid) -> Option<CardUser> {
        match self.writes.card_users.get(&id) {
            Some(user) => Some(user.clone()),
            None => self.store.tables.lock().await.card_users.get(&id).cloned(),
        }
    }

    /// Lock, modify and buffer a card row.
    async fn write_card(&mut self, id: Uuid, change: impl FnOnce(&mut Card)) -> Option<Card> {
        self.lock_row(id).await;
        let mut card = self.current_card(id).await?;
        change(&mut card);
        card.updated_at = Utc::now();
        self.writes.cards.insert(id, card.clone());
        Some(card)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn card_by_id(&mut self, id: Uuid) -> Result<Option<Card>, StoreError> {
        self.lock_row(id).await;
        let card = self.current_card(id).await;
        // Give concurrent transactions a chance to interleave, as a database round trip would
        tokio::task::yield_now().await;
        Ok(card)
    }

    async fn card_user_by_id(&mut self, id: Uuid) -> Result<Option<CardUser>, StoreError> {
        self.lock_row(id).await;
        let user = self.current_card_user(id).await;
        tokio::task::yield_now().await;
        Ok(user)
    }

    async fn card_transaction_by_ref(
        &mut self,
        provider_ref: &str,
    ) -> Result<Option<CardTransaction>, StoreError> {
        if let Some(line) = self
            .writes
            .card_transactions
            .values()
            .find(|line| line.provider_ref == provider_ref)
        {
            return Ok(Some(line.clone()));
        }
        Ok(self.store.card_transaction(provider_ref).await)
    }

    async fn main_transaction_by_ref(
        &mut self,
        reference: &str,
    ) -> Result<Option<MainTransaction>, StoreError> {
        if let Some(entry) = self
            .writes
            .main_transactions
            .values()
            .find(|entry| entry.reference == reference)
        {
            return Ok(Some(entry.clone()));
        }
        Ok(self.store.main_transaction(reference).await)
    }

    async fn update_card_balance(
        &mut self,
        card_id: Uuid,
        balance: i64,
        reset_decline_count: bool,
    ) -> Result<Option<Card>, StoreError> {
        let skew = self.store.tables.lock().await.card_balance_write_skew;
        Ok(self
            .write_card(card_id, |card| {
                card.balance = balance + skew;
                if reset_decline_count {
                    card.insufficient_funds_decline_count = 0;
                }
            })
            .await)
    }

    async fn update_card_user_balance(
        &mut self,
        card_user_id: Uuid,
        balance: i64,
    ) -> Result<Option<CardUser>, StoreError> {
        self.lock_row(card_user_id).await;
        let Some(mut user) = self.current_card_user(card_user_id).await else {
            return Ok(None);
        };
        user.balance = balance;
        user.updated_at = Utc::now();
        self.writes.card_users.insert(card_user_id, user.clone());
        Ok(Some(user))
    }

    async fn increment_decline_count(&mut self, card_id: Uuid) -> Result<Option<Card>, StoreError> {
        Ok(self
            .write_card(card_id, |card| card.insufficient_funds_decline_count += 1)
            .await)
    }

    async fn update_card_status(
        &mut self,
        card_id: Uuid,
        status: CardStatus,
    ) -> Result<Option<Card>, StoreError> {
        Ok(self.write_card(card_id, |card| card.status = status).await)
    }

    async fn create_card_transaction(
        &mut self,
        line: NewCardTransaction,
    ) -> Result<CardTransaction, StoreError> {
        if self.card_transaction_by_ref(&line.provider_ref).await?.is_some() {
            return Err(StoreError::CorruptRow {
                table: "card_transactions",
                detail: format!("duplicate provider_ref {}", line.provider_ref),
            });
        }

        let now = Utc::now();
        let record = CardTransaction {
            id: Uuid::new_v4(),
            card_id: line.card_id,
            card_user_id: line.card_user_id,
            user_id: line.user_id,
            provider_ref: line.provider_ref,
            kind: line.kind,
            status: line.status,
            amount: line.amount,
            fee: line.fee,
            currency: line.currency,
            balance_before: line.balance_before,
            balance_after: line.balance_after,
            merchant: line.merchant,
            decline_reason: line.decline_reason,
            fee_provider_ref: None,
            fee_settled: line.fee_settled,
            created_at: now,
            updated_at: now,
        };
        self.writes
            .card_transactions
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_card_transaction(
        &mut self,
        id: Uuid,
        patch: &CardTransactionPatch,
    ) -> Result<Option<CardTransaction>, StoreError> {
        let current = match self.writes.card_transactions.get(&id) {
            Some(line) => Some(line.clone()),
            None => self.store.tables.lock().await.card_transactions.get(&id).cloned(),
        };
        let Some(mut line) = current else {
            return Ok(None);
        };

        if let Some(status) = patch.status {
            line.status = status;
        }
        if let Some(amount) = patch.amount {
            line.amount = amount;
        }
        if let Some(fee) = patch.fee {
            line.fee = fee;
        }
        if let Some(before) = patch.balance_before {
            line.balance_before = Some(before);
        }
        if let Some(after) = patch.balance_after {
            line.balance_after = Some(after);
        }
        if let Some(reason) = &patch.decline_reason {
            line.decline_reason = Some(reason.clone());
        }
        if let Some(settled) = patch.fee_settled {
            line.fee_settled = settled;
        }
        line.updated_at = Utc::now();
        self.writes.card_transactions.insert(id, line.clone());
        Ok(Some(line))
    }

    async fn create_main_transaction(
        &mut self,
        entry: NewMainTransaction,
    ) -> Result<MainTransaction, StoreError> {
        let now = Utc::now();
        let record = MainTransaction {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            reference: entry.reference,
            kind: entry.kind,
            status: entry.status,
            amount: entry.amount,
            fee: entry.fee,
            currency: entry.currency,
            balance_before: entry.balance_before,
            balance_after: entry.balance_after,
            metadata: entry.metadata,
            created_at: now,
            updated_at: now,
        };
        self.writes
            .main_transactions
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_main_transaction(
        &mut self,
        id: Uuid,
        patch: &MainTransactionPatch,
    ) -> Result<Option<MainTransaction>, StoreError> {
        let current = match self.writes.main_transactions.get(&id) {
            Some(entry) => Some(entry.clone()),
            None => self.store.tables.lock().await.main_transactions.get(&id).cloned(),
        };
        let Some(mut entry) = current else {
            return Ok(None);
        };

        if let Some(status) = patch.status {
            entry.status = status;
        }
        if let Some(amount) = patch.amount {
            entry.amount = amount;
        }
        if let Some(fee) = patch.fee {
            entry.fee = fee;
        }
        if let Some(before) = patch.balance_before {
            entry.balance_before = Some(before);
        }
        if let Some(after) = patch.balance_after {
            entry.balance_after = Some(after);
        }
        entry.updated_at = Utc::now();
        self.writes.main_transactions.insert(id, entry.clone());
        Ok(Some(entry))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            store,
            row_guards,
            writes,
        } = *self;

        let mut tables = store.tables.lock().await;
        tables.cards.extend(writes.cards);
        tables.card_users.extend(writes.card_users);
        tables.card_transactions.extend(writes.card_transactions);
        tables.main_transactions.extend(writes.main_transactions);
        drop(tables);

        // Row locks are released only once the writes are visible
        drop(row_guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{card_fixture, card_user_fixture};

    async fn seeded() -> (MemoryStore, Card) {
        let store = MemoryStore::new();
        let user = card_user_fixture(1_000);
        let card = card_fixture(&user, 1_000);
        store.insert_card_user(user).await;
        store.insert_card(card.clone()).await;
        (store, card)
    }

    #[tokio::test]
    async fn locked_card_read_waits_for_commit_and_sees_new_balance() {
        let (store, card) = seeded().await;

        let mut first = store.begin().await.unwrap();
        first.card_by_id(card.id).await.unwrap();
        first.update_card_balance(card.id, 900, false).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), second.card_by_id(card.id)).await;
        assert!(blocked.is_err());

        first.commit().await.unwrap();
        let seen = second.card_by_id(card.id).await.unwrap().unwrap();
        assert_eq!(seen.balance, 900);
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_and_discarded_on_drop() {
        let (store, card) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        tx.update_card_balance(card.id, 1, false).await.unwrap();
        assert_eq!(tx.card_by_id(card.id).await.unwrap().unwrap().balance, 1);
        assert_eq!(store.card(card.id).await.unwrap().balance, 1_000);

        drop(tx);
        assert_eq!(store.card(card.id).await.unwrap().balance, 1_000);

        // The row lock went with the dropped transaction.
        let mut next = store.begin().await.unwrap();
        assert_eq!(next.card_by_id(card.id).await.unwrap().unwrap().balance, 1_000);
    }
}
