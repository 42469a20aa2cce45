//! Balance reconciliation engine.
//!
//! Turns validated spend and collateral events into card, card-user and
//! ledger writes.
//!
//! # Mutation Flow
//!
//! ```text
//! resolve card + card-user -> ownership check -> validate against stored line
//!   -> acquire lock (user, provider transaction, card)
//!     -> begin store transaction
//!       -> re-read card + card-user by id, re-validate
//!       -> card balance -> card-user balance (each verified by read-back)
//!       -> decline counting -> card transaction -> main transaction
//!     -> commit
//!   -> release lock
//! -> fee charge, provider lock, notifications (best-effort, spawned)
//! ```
//!
//! Business rejections come back as `LedgerOutcome::Rejected`. Anything
//! returned as `EngineError` from inside the store transaction has rolled
//! every write back.

use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    db::{EntityStore, StoreTransaction},
    error::{EngineError, Rejection},
    models::{
        card::{Card, CardUser},
        ledger::{
            CardTransaction, CardTransactionPatch, CardTransactionStatus, MainTransactionPatch,
            MerchantInfo, NewCardTransaction, NewMainTransaction, TransactionKind,
        },
        webhook::{CollateralEvent, SpendEvent},
    },
    services::{
        balance,
        fees::{FeeKind, FeeQuote, FeeSchedule, FeeService},
        idempotency::{
            AmountTolerance, IncomingEvent, LedgerSnapshot, Validation, ValidationReason,
            validate_transition,
        },
        lock::{DistributedLock, LockKey},
        notifications::{
            BalanceChanged, CardNotification, NotificationKind, Notifier, channels_for,
        },
        provider::CardProvider,
        risk::{self, DeclinePolicy},
    },
};

/// Where post-commit effects run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideEffectDispatch {
    /// On a spawned task; the caller gets its outcome once the commit is done
    #[default]
    Background,
    /// Awaited before the outcome is returned
    Inline,
}

/// Tunables of the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tolerance: AmountTolerance,
    pub decline_policy: DeclinePolicy,

    /// Currency recorded when an event does not carry one
    pub currency: String,

    pub side_effects: SideEffectDispatch,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tolerance: AmountTolerance::default(),
            decline_policy: DeclinePolicy::default(),
            currency: "USD".to_string(),
            side_effects: SideEffectDispatch::default(),
        }
    }
}

/// Spend authorization decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Authorization {
    Approved { card: Card },
    Rejected(Rejection),
}

/// Committed mutation, as seen after the store transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMutation {
    pub line: CardTransaction,
    pub card: Card,
    pub card_user: CardUser,

    /// Signed change applied to both balances
    pub delta: i64,

    /// Whether this mutation blocked the card
    pub card_blocked: bool,
}

/// Result of a ledger-mutating event.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOutcome {
    Applied(Box<AppliedMutation>),
    Duplicate,
    Rejected(Rejection),
}

impl LedgerOutcome {
    /// Outcome to return instead of mutating, if the validator says so.
    fn from_validation(validation: Validation) -> Option<Self> {
        if validation.may_proceed() {
            return None;
        }
        match validation.reason {
            Some(ValidationReason::Rejected(rejection)) => Some(LedgerOutcome::Rejected(rejection)),
            _ => Some(LedgerOutcome::Duplicate),
        }
    }
}

type Resolution<T> = Result<T, Rejection>;

/// Everything the write step needs to know about one event.
struct Mutation<'a> {
    transaction_ref: &'a str,
    kind: TransactionKind,
    status: CardTransactionStatus,
    amount: i64,
    fee: FeeQuote,

    /// Net credit of a deposit; unused for spends
    amount_to_credit: i64,

    currency: String,
    merchant: MerchantInfo,
    decline_reason: Option<String>,
    metadata: Value,

    /// Count this event as an insufficient-funds decline
    count_decline: bool,
}

impl Mutation<'_> {
    fn incoming(&self) -> IncomingEvent {
        IncomingEvent {
            status: self.status,
            amount: self.amount,
        }
    }

    fn delta(&self, existing: Option<LedgerSnapshot>) -> i64 {
        match self.kind {
            TransactionKind::Spend => balance::spend_delta(existing, self.incoming()),
            TransactionKind::Deposit => {
                balance::deposit_delta(existing, self.incoming(), self.amount_to_credit)
            }
        }
    }

    fn resets_decline_count(&self) -> bool {
        self.kind == TransactionKind::Spend && self.status == CardTransactionStatus::Successful
    }
}

enum Written {
    Skipped(LedgerOutcome),
    Committed(Box<AppliedMutation>),
}

/// Best-effort collaborators called after commit.
#[derive(Clone)]
struct SideEffects {
    fees: Arc<FeeService>,
    provider: Arc<dyn CardProvider>,
    notifier: Arc<dyn Notifier>,
}

/// The transactional core. Collaborators are passed in at construction.
pub struct ReconciliationEngine {
    store: Arc<dyn EntityStore>,
    lock: Arc<dyn DistributedLock>,
    effects: SideEffects,
    settings: EngineSettings,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn EntityStore>,
        lock: Arc<dyn DistributedLock>,
        provider: Arc<dyn CardProvider>,
        notifier: Arc<dyn Notifier>,
        fee_schedule: FeeSchedule,
        settings: EngineSettings,
    ) -> Self {
        let fees = Arc::new(FeeService::new(store.clone(), provider.clone(), fee_schedule));
        Self {
            store,
            lock,
            effects: SideEffects {
                fees,
                provider,
                notifier,
            },
            settings,
        }
    }

    pub fn fees(&self) -> &FeeService {
        &self.effects.fees
    }

    /// Decide a spend authorization request. Never writes.
    pub async fn authorize_spend(&self, spend: &SpendEvent) -> Result<Authorization, EngineError> {
        let amount = balance::to_minor_units(spend.amount)?;

        let (card, _card_user) = match self.resolve_spend_parties(spend).await? {
            Ok(parties) => parties,
            Err(rejection) => return Ok(Authorization::Rejected(rejection)),
        };

        Ok(match balance::authorize_spend(&card, amount) {
            Ok(()) => Authorization::Approved { card },
            Err(rejection) => {
                tracing::info!(
                    card_id = %card.id,
                    amount,
                    balance = card.balance,
                    reason = %rejection,
                    "Spend authorization rejected"
                );
                Authorization::Rejected(rejection)
            }
        })
    }

    /// Apply a spend creation, update or completion.
    pub async fn apply_spend(
        &self,
        transaction_ref: &str,
        spend: &SpendEvent,
    ) -> Result<LedgerOutcome, EngineError> {
        let amount = balance::to_minor_units(spend.amount)?;
        let status = CardTransactionStatus::from(spend.status);

        let (card, card_user) = match self.resolve_spend_parties(spend).await? {
            Ok(parties) => parties,
            Err(rejection) => return Ok(LedgerOutcome::Rejected(rejection)),
        };

        let count_decline = status == CardTransactionStatus::Declined
            && risk::is_insufficient_funds(spend.declined_reason.as_deref());
        let fee = if count_decline {
            self.fees()
                .schedule()
                .quote(FeeKind::InsufficientFundsDecline, amount)
        } else {
            FeeQuote::NONE
        };

        let merchant = spend.merchant();
        let metadata = json!({
            "cardId": card.id,
            "cardLastFour": card.last_four,
            "merchantName": merchant.name,
            "merchantCategory": merchant.category,
        });

        let mutation = Mutation {
            transaction_ref,
            kind: TransactionKind::Spend,
            status,
            amount,
            fee,
            amount_to_credit: 0,
            currency: spend
                .currency
                .clone()
                .unwrap_or_else(|| self.settings.currency.clone()),
            merchant,
            decline_reason: spend.declined_reason.clone(),
            metadata,
            count_decline,
        };

        self.reconcile(card, card_user, mutation).await
    }

    /// Apply a collateral (funding) event to the card-user's primary card.
    pub async fn apply_collateral(
        &self,
        transaction_ref: &str,
        collateral: &CollateralEvent,
    ) -> Result<LedgerOutcome, EngineError> {
        let amount = balance::to_minor_units(collateral.amount)?;
        let status = CardTransactionStatus::from(collateral.status);

        let Some(card_user) = self.resolve_collateral_owner(collateral).await? else {
            return Ok(LedgerOutcome::Rejected(Rejection::CardUserNotFound));
        };
        let Some(card) = self.store.find_primary_card(card_user.id).await? else {
            return Ok(LedgerOutcome::Rejected(Rejection::CardNotFound));
        };
        if let Err(rejection) = balance::ensure_card_owner(&card, &card_user) {
            return Ok(LedgerOutcome::Rejected(rejection));
        }

        let (fee, amount_to_credit) = match status {
            CardTransactionStatus::Pending | CardTransactionStatus::Successful => {
                let fee = self.fees().schedule().quote(FeeKind::Deposit, amount);
                let credit = balance::deposit_credit(amount, fee.fee)?;
                (fee, credit.amount_to_credit)
            }
            CardTransactionStatus::Declined | CardTransactionStatus::Canceled => {
                (FeeQuote::NONE, 0)
            }
        };

        let mutation = Mutation {
            transaction_ref,
            kind: TransactionKind::Deposit,
            status,
            amount,
            fee,
            amount_to_credit,
            currency: collateral
                .currency
                .clone()
                .unwrap_or_else(|| self.settings.currency.clone()),
            merchant: MerchantInfo::default(),
            decline_reason: None,
            metadata: json!({
                "cardId": card.id,
                "chainId": collateral.chain_id,
                "walletAddress": collateral.wallet_address,
                "transactionHash": collateral.transaction_hash,
            }),
            count_decline: false,
        };

        self.reconcile(card, card_user, mutation).await
    }

    async fn resolve_spend_parties(
        &self,
        spend: &SpendEvent,
    ) -> Result<Resolution<(Card, CardUser)>, EngineError> {
        let Some(card) = self.store.find_card_by_provider_ref(&spend.card_id).await? else {
            return Ok(Err(Rejection::CardNotFound));
        };

        let card_user = match spend.user_id.as_deref() {
            Some(user_ref) => self.store.find_card_user_by_provider_ref(user_ref).await?,
            None => self.store.find_card_user_by_id(card.card_user_id).await?,
        };
        let Some(card_user) = card_user else {
            return Ok(Err(Rejection::CardUserNotFound));
        };

        if let Err(rejection) = balance::ensure_card_owner(&card, &card_user) {
            return Ok(Err(rejection));
        }
        Ok(Ok((card, card_user)))
    }

    /// Provider user reference first, then the registered deposit address.
    async fn resolve_collateral_owner(
        &self,
        collateral: &CollateralEvent,
    ) -> Result<Option<CardUser>, EngineError> {
        if let Some(user_ref) = collateral.user_id.as_deref()
            && let Some(card_user) = self.store.find_card_user_by_provider_ref(user_ref).await?
        {
            return Ok(Some(card_user));
        }

        let (Some(chain_id), Some(address)) =
            (collateral.chain_id, collateral.wallet_address.as_deref())
        else {
            return Ok(None);
        };
        let Some(deposit_address) = self.store.find_deposit_address(chain_id, address).await?
        else {
            return Ok(None);
        };

        Ok(self
            .store
            .find_card_user_by_user_id(deposit_address.user_id)
            .await?)
    }

    async fn reconcile(
        &self,
        card: Card,
        card_user: CardUser,
        mutation: Mutation<'_>,
    ) -> Result<LedgerOutcome, EngineError> {
        let existing = self
            .store
            .find_card_transaction_by_ref(mutation.transaction_ref)
            .await?;

        if let Some(line) = &existing
            && line.card_id != card.id
        {
            tracing::error!(
                transaction_ref = %mutation.transaction_ref,
                card_id = %card.id,
                line_card_id = %line.card_id,
                "Ledger line belongs to a different card"
            );
            return Ok(LedgerOutcome::Rejected(Rejection::UnauthorizedCardAccess));
        }

        let validation = validate_transition(
            existing.as_ref().map(LedgerSnapshot::from),
            mutation.incoming(),
            self.settings.tolerance,
        );
        if let Some(outcome) = LedgerOutcome::from_validation(validation) {
            return Ok(outcome);
        }

        let key = LockKey::for_transaction(card.user_id, mutation.transaction_ref, card.id);
        let guard = self.lock.acquire(&key).await?;
        let written = self.write(card.id, card_user.id, &mutation).await;
        guard.release().await;

        let applied = match written? {
            Written::Skipped(outcome) => return Ok(outcome),
            Written::Committed(applied) => applied,
        };

        match self.settings.side_effects {
            SideEffectDispatch::Background => {
                let effects = self.effects.clone();
                let committed = applied.clone();
                tokio::spawn(async move { effects.run(&committed).await });
            }
            SideEffectDispatch::Inline => self.effects.run(&applied).await,
        }
        Ok(LedgerOutcome::Applied(applied))
    }

    /// The store transaction. Any error drops `tx`, rolling everything back.
    async fn write(
        &self,
        card_id: Uuid,
        card_user_id: Uuid,
        mutation: &Mutation<'_>,
    ) -> Result<Written, EngineError> {
        let mut tx = self.store.begin().await?;

        let card = tx
            .card_by_id(card_id)
            .await?
            .ok_or(EngineError::NotFoundDuringBalanceUpdate {
                entity: "card",
                id: card_id,
            })?;
        let card_user = tx
            .card_user_by_id(card_user_id)
            .await?
            .ok_or(EngineError::NotFoundDuringBalanceUpdate {
                entity: "card_user",
                id: card_user_id,
            })?;

        // Another delivery may have committed while we waited for the lock.
        let existing = tx.card_transaction_by_ref(mutation.transaction_ref).await?;
        let snapshot = existing.as_ref().map(LedgerSnapshot::from);
        let validation = validate_transition(snapshot, mutation.incoming(), self.settings.tolerance);
        if let Some(outcome) = LedgerOutcome::from_validation(validation) {
            tx.rollback().await?;
            return Ok(Written::Skipped(outcome));
        }

        let delta = mutation.delta(snapshot);
        let card_balance = balance::apply_delta("card", card.id, card.balance, delta)?;
        let card_user_balance =
            balance::apply_delta("card_user", card_user.id, card_user.balance, delta)?;

        let mut card_after = write_card_balance(
            tx.as_mut(),
            card.id,
            card_balance,
            mutation.resets_decline_count(),
        )
        .await?;
        let card_user_after =
            write_card_user_balance(tx.as_mut(), card_user.id, card_user_balance).await?;

        let mut card_blocked = false;
        if mutation.count_decline {
            let record = self
                .settings
                .decline_policy
                .record_decline(tx.as_mut(), card.id)
                .await?;
            card_blocked = record.newly_blocked;
            card_after = record.card;
        }

        let line = match existing {
            None => {
                tx.create_card_transaction(NewCardTransaction {
                    card_id: card.id,
                    card_user_id: card_user.id,
                    user_id: card.user_id,
                    provider_ref: mutation.transaction_ref.to_string(),
                    kind: mutation.kind,
                    status: mutation.status,
                    amount: mutation.amount,
                    fee: mutation.fee.fee,
                    currency: mutation.currency.clone(),
                    balance_before: Some(card.balance),
                    balance_after: Some(card_balance),
                    merchant: mutation.merchant.clone(),
                    decline_reason: mutation.decline_reason.clone(),
                    fee_settled: mutation.fee.settled_on_write(),
                })
                .await?
            }
            Some(line) => {
                let moved = delta != 0;
                let has_fee = mutation.fee.fee > 0;
                let patch = CardTransactionPatch {
                    status: Some(mutation.status),
                    amount: Some(mutation.amount),
                    fee: has_fee.then_some(mutation.fee.fee),
                    balance_before: moved.then_some(card.balance),
                    balance_after: moved.then_some(card_balance),
                    decline_reason: mutation.decline_reason.clone(),
                    fee_settled: has_fee.then_some(mutation.fee.settled_on_write()),
                };
                tx.update_card_transaction(line.id, &patch)
                    .await?
                    .ok_or(EngineError::NotFoundDuringBalanceUpdate {
                        entity: "card_transaction",
                        id: line.id,
                    })?
            }
        };

        let main_status = mutation.status.to_main_status();
        match tx.main_transaction_by_ref(mutation.transaction_ref).await? {
            None => {
                tx.create_main_transaction(NewMainTransaction {
                    user_id: card.user_id,
                    reference: mutation.transaction_ref.to_string(),
                    kind: mutation.kind,
                    status: main_status,
                    amount: mutation.amount,
                    fee: line.fee,
                    currency: line.currency.clone(),
                    balance_before: line.balance_before,
                    balance_after: line.balance_after,
                    metadata: mutation.metadata.clone(),
                })
                .await?;
            }
            Some(entry) => {
                let patch = MainTransactionPatch {
                    status: Some(main_status),
                    amount: Some(mutation.amount),
                    fee: Some(line.fee),
                    balance_before: line.balance_before,
                    balance_after: line.balance_after,
                };
                tx.update_main_transaction(entry.id, &patch)
                    .await?
                    .ok_or(EngineError::NotFoundDuringBalanceUpdate {
                        entity: "main_transaction",
                        id: entry.id,
                    })?;
            }
        }

        tx.commit().await?;

        tracing::info!(
            card_id = %card.id,
            transaction_ref = %mutation.transaction_ref,
            kind = mutation.kind.as_str(),
            status = %mutation.status,
            balance_before = card.balance,
            balance_after = card_balance,
            "Balance mutation committed"
        );

        Ok(Written::Committed(Box::new(AppliedMutation {
            line,
            card: card_after,
            card_user: card_user_after,
            delta,
            card_blocked,
        })))
    }
}

impl SideEffects {
    /// Best-effort effects of a committed mutation. Failures are logged only.
    async fn run(&self, applied: &AppliedMutation) {
        let AppliedMutation {
            line,
            card,
            card_user,
            delta,
            card_blocked,
        } = applied;

        self.fees.collect(line, &card_user.provider_ref).await;

        if *card_blocked {
            risk::lock_at_provider(self.provider.as_ref(), card).await;
            let notification = CardNotification::card_blocked(card, &line.currency);
            self.notify(&notification).await;
        }

        if let Some(kind) = NotificationKind::for_line(line) {
            self.notify(&CardNotification::for_line(kind, card, line))
                .await;
        }

        if *delta != 0 {
            let event = BalanceChanged::for_card(card, line, *delta);
            if let Err(e) = self.notifier.emit_balance_changed(&event).await {
                tracing::warn!(
                    transaction_ref = %line.provider_ref,
                    error = %e,
                    "Failed to emit balance changed event"
                );
            }
        }
    }

    async fn notify(&self, notification: &CardNotification) {
        if let Err(e) = self
            .notifier
            .send_card_notification(channels_for(notification.kind), notification)
            .await
        {
            tracing::warn!(
                kind = ?notification.kind,
                card_id = %notification.card_id,
                error = %e,
                "Failed to send card notification"
            );
        }
    }
}

/// Write a card balance and read it back.
async fn write_card_balance(
    tx: &mut dyn StoreTransaction,
    card_id: Uuid,
    expected: i64,
    reset_decline_count: bool,
) -> Result<Card, EngineError> {
    let updated = tx
        .update_card_balance(card_id, expected, reset_decline_count)
        .await?;
    verify_balance("card", card_id, expected, updated.map(|card| card.balance))?;

    let card = tx.card_by_id(card_id).await?;
    verify_balance("card", card_id, expected, card.as_ref().map(|card| card.balance))?;
    card.ok_or(EngineError::VerificationFailed {
        entity: "card",
        id: card_id,
        expected,
        actual: None,
    })
}

/// Write a card-user balance and read it back.
async fn write_card_user_balance(
    tx: &mut dyn StoreTransaction,
    card_user_id: Uuid,
    expected: i64,
) -> Result<CardUser, EngineError> {
    let updated = tx.update_card_user_balance(card_user_id, expected).await?;
    verify_balance(
        "card_user",
        card_user_id,
        expected,
        updated.map(|user| user.balance),
    )?;

    let card_user = tx.card_user_by_id(card_user_id).await?;
    verify_balance(
        "card_user",
        card_user_id,
        expected,
        card_user.as_ref().map(|user| user.balance),
    )?;
    card_user.ok_or(EngineError::VerificationFailed {
        entity: "card_user",
        id: card_user_id,
        expected,
        actual: None,
    })
}

fn verify_balance(
    entity: &'static str,
    id: Uuid,
    expected: i64,
    actual: Option<i64>,
) -> Result<(), EngineError> {
    if actual == Some(expected) {
        return Ok(());
    }
    Err(EngineError::VerificationFailed {
        entity,
        id,
        expected,
        actual,
    })
}
