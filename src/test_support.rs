//! Shared test fixtures: entity builders, recording collaborators and a
//! fully wired engine over the in-memory store.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    db::{EntityStore, memory::MemoryStore},
    error::ProviderError,
    models::{
        card::{Card, CardStatus, CardUser},
        ledger::{
            CardTransaction, CardTransactionStatus, MerchantInfo, NewCardTransaction,
            TransactionKind,
        },
        webhook::{CollateralEvent, ProviderCollateralStatus, ProviderSpendStatus, SpendEvent},
    },
    services::{
        fees::{FeeRule, FeeSchedule, FeeSettlement},
        lock::LocalLock,
        notifications::{BalanceChanged, CardNotification, Channel, Notifier},
        profiles::ProfileService,
        provider::{CardProvider, ChargeReceipt, ProviderCardStatusUpdate},
        reconciliation::{EngineSettings, ReconciliationEngine, SideEffectDispatch},
        router::EventRouter,
    },
};

pub fn card_user_fixture(balance: i64) -> CardUser {
    let id = Uuid::new_v4();
    let now = Utc::now();
    CardUser {
        id,
        user_id: Uuid::new_v4(),
        provider_ref: format!("usr_{}", id.simple()),
        status: "approved".to_string(),
        balance,
        created_at: now,
        updated_at: now,
    }
}

/// Active card owned by `card_user`.
pub fn card_fixture(card_user: &CardUser, balance: i64) -> Card {
    let id = Uuid::new_v4();
    let now = Utc::now();
    Card {
        id,
        user_id: card_user.user_id,
        card_user_id: card_user.id,
        provider_ref: format!("card_{}", id.simple()),
        status: CardStatus::Active,
        balance,
        spending_limit: None,
        limit_frequency: None,
        is_frozen: false,
        insufficient_funds_decline_count: 0,
        expiration_month: Some(12),
        expiration_year: Some(2030),
        last_four: Some("1234".to_string()),
        created_at: now,
        updated_at: now,
    }
}

pub fn new_line(
    card: &Card,
    provider_ref: &str,
    kind: TransactionKind,
    status: CardTransactionStatus,
    amount: i64,
    fee: i64,
) -> NewCardTransaction {
    NewCardTransaction {
        card_id: card.id,
        card_user_id: card.card_user_id,
        user_id: card.user_id,
        provider_ref: provider_ref.to_string(),
        kind,
        status,
        amount,
        fee,
        currency: "USD".to_string(),
        balance_before: None,
        balance_after: None,
        merchant: MerchantInfo::default(),
        decline_reason: None,
        fee_settled: fee == 0,
    }
}

/// Insert a ledger line through a committed store transaction.
pub async fn seed_line(store: &MemoryStore, line: NewCardTransaction) -> CardTransaction {
    let mut tx = store.begin().await.unwrap();
    let created = tx.create_card_transaction(line).await.unwrap();
    tx.commit().await.unwrap();
    created
}

/// Ledger line built in memory, never stored.
pub fn line_fixture(
    card: &Card,
    provider_ref: &str,
    kind: TransactionKind,
    status: CardTransactionStatus,
    amount: i64,
) -> CardTransaction {
    let now = Utc::now();
    CardTransaction {
        id: Uuid::new_v4(),
        card_id: card.id,
        card_user_id: card.card_user_id,
        user_id: card.user_id,
        provider_ref: provider_ref.to_string(),
        kind,
        status,
        amount,
        fee: 0,
        currency: "USD".to_string(),
        balance_before: None,
        balance_after: None,
        merchant: MerchantInfo::default(),
        decline_reason: None,
        fee_provider_ref: None,
        fee_settled: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn spend_event(card: &Card, amount: f64, status: ProviderSpendStatus) -> SpendEvent {
    SpendEvent {
        amount,
        currency: None,
        card_id: card.provider_ref.clone(),
        user_id: None,
        status,
        declined_reason: None,
        merchant_name: Some("Corner Shop".to_string()),
        merchant_city: None,
        merchant_country: None,
        merchant_category: None,
        merchant_category_code: None,
    }
}

pub fn collateral_event(
    card_user: &CardUser,
    amount: f64,
    status: ProviderCollateralStatus,
) -> CollateralEvent {
    CollateralEvent {
        amount,
        currency: None,
        user_id: Some(card_user.provider_ref.clone()),
        chain_id: None,
        wallet_address: None,
        transaction_hash: None,
        status,
    }
}

fn unavailable() -> ProviderError {
    ProviderError::Status {
        status: 503,
        body: "unavailable".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCharge {
    pub provider_user_ref: String,
    pub amount_minor: i64,
    pub description: String,
    pub idempotency_key: String,
}

/// Card provider recording every call. Fails on demand.
#[derive(Default)]
pub struct MockProvider {
    charges: Mutex<Vec<RecordedCharge>>,
    status_updates: Mutex<Vec<(String, ProviderCardStatusUpdate)>>,
    fail: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every charge attempt, failed ones included.
    pub fn charges(&self) -> Vec<RecordedCharge> {
        self.charges.lock().unwrap().clone()
    }

    pub fn status_updates(&self) -> Vec<(String, ProviderCardStatusUpdate)> {
        self.status_updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl CardProvider for MockProvider {
    async fn create_charge(
        &self,
        provider_user_ref: &str,
        amount_minor: i64,
        description: &str,
        idempotency_key: &str,
    ) -> Result<ChargeReceipt, ProviderError> {
        let mut charges = self.charges.lock().unwrap();
        charges.push(RecordedCharge {
            provider_user_ref: provider_user_ref.to_string(),
            amount_minor,
            description: description.to_string(),
            idempotency_key: idempotency_key.to_string(),
        });

        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(ChargeReceipt {
            provider_ref: format!("chg_{}", charges.len()),
        })
    }

    async fn update_card_status(
        &self,
        provider_card_ref: &str,
        status: ProviderCardStatusUpdate,
    ) -> Result<(), ProviderError> {
        self.status_updates
            .lock()
            .unwrap()
            .push((provider_card_ref.to_string(), status));

        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }
}

/// Notifier keeping everything it was asked to deliver.
#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<CardNotification>>,
    balance_events: Mutex<Vec<BalanceChanged>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn notifications(&self) -> Vec<CardNotification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn balance_events(&self) -> Vec<BalanceChanged> {
        self.balance_events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_card_notification(
        &self,
        _channels: &[Channel],
        notification: &CardNotification,
    ) -> Result<(), ProviderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }

    async fn emit_balance_changed(&self, event: &BalanceChanged) -> Result<(), ProviderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.balance_events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Deposit fee of 100 bps charged through the provider, no decline fee.
pub fn test_fee_schedule() -> FeeSchedule {
    FeeSchedule {
        deposit: FeeRule {
            bps: 100,
            flat_minor: 0,
        },
        insufficient_funds_decline: FeeRule::flat(0),
        settlement: FeeSettlement::ProviderCharge,
    }
}

/// Engine wired to the in-memory store, a local lock and recording collaborators.
///
/// Post-commit effects run inline so tests can assert on them right away.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<MockProvider>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: Arc<ReconciliationEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_fees(test_fee_schedule())
    }

    pub fn with_fees(fee_schedule: FeeSchedule) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            Arc::new(LocalLock::new()),
            provider.clone(),
            notifier.clone(),
            fee_schedule,
            EngineSettings {
                side_effects: SideEffectDispatch::Inline,
                ..EngineSettings::default()
            },
        ));

        Self {
            store,
            provider,
            notifier,
            engine,
        }
    }

    pub fn router(&self) -> EventRouter {
        EventRouter::new(self.engine.clone(), ProfileService::new(self.store.clone()))
    }

    /// Store a card-user and one active card, with the given balances.
    pub async fn seed(&self, card_user_balance: i64, card_balance: i64) -> (CardUser, Card) {
        let card_user = card_user_fixture(card_user_balance);
        let card = card_fixture(&card_user, card_balance);
        self.store.insert_card_user(card_user.clone()).await;
        self.store.insert_card(card.clone()).await;
        (card_user, card)
    }
}
