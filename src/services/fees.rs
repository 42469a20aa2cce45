//! Fee assessment and settlement.
//!
//! Fees are quoted before the balance write (the deposit fee is deducted
//! from the credited amount) and collected after commit through the
//! provider charge API. A failed charge leaves the line unsettled; the
//! periodic sweep in `retry_unsettled` picks it up again.

use std::sync::Arc;

use serde::Deserialize;

use crate::{
    db::EntityStore,
    error::StoreError,
    models::ledger::{CardTransaction, CardTransactionStatus, TransactionKind},
    services::provider::CardProvider,
};

/// Basis-point denominator.
const BPS: i128 = 10_000;

/// How a fee is accounted for once quoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeSettlement {
    /// Collected by an external charge after commit
    #[default]
    ProviderCharge,
    /// Deducted locally only, settled on write
    Inline,
}

/// `round_half_up(amount * bps / 10000) + flat_minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeRule {
    pub bps: u32,
    pub flat_minor: i64,
}

impl FeeRule {
    pub fn flat(flat_minor: i64) -> Self {
        Self { bps: 0, flat_minor }
    }

    /// Returns the rounded fee and whether the exact fee was non-zero.
    fn apply(&self, amount: i64) -> (i64, bool) {
        let proportional = i128::from(amount.max(0)) * i128::from(self.bps);
        let rounded = (proportional + BPS / 2) / BPS + i128::from(self.flat_minor.max(0));
        let exact_positive = proportional > 0 || self.flat_minor > 0;
        (i64::try_from(rounded).unwrap_or(i64::MAX), exact_positive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeSchedule {
    pub deposit: FeeRule,
    pub insufficient_funds_decline: FeeRule,
    pub settlement: FeeSettlement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeKind {
    Deposit,
    InsufficientFundsDecline,
}

impl FeeKind {
    fn description(&self) -> &'static str {
        match self {
            FeeKind::Deposit => "Deposit fee",
            FeeKind::InsufficientFundsDecline => "Insufficient funds decline fee",
        }
    }
}

/// Fee to record on a ledger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub fee: i64,

    /// Whether an external charge is still owed after commit
    pub requires_charge: bool,
}

impl FeeQuote {
    pub const NONE: FeeQuote = FeeQuote {
        fee: 0,
        requires_charge: false,
    };

    /// Value of the line's `fee_settled` column at creation.
    pub fn settled_on_write(&self) -> bool {
        !self.requires_charge
    }
}

impl FeeSchedule {
    /// Quote the fee for `amount`.
    ///
    /// A fee that rounds to zero is raised to one minor unit when it has to
    /// be charged externally, and dropped otherwise.
    ///
    /// Inline settlement applies to deposits only, where the fee comes off
    /// the credited amount. A declined spend moves no money to deduct from,
    /// so its fee is always charged externally.
    pub fn quote(&self, kind: FeeKind, amount: i64) -> FeeQuote {
        let (rule, settlement) = match kind {
            FeeKind::Deposit => (self.deposit, self.settlement),
            FeeKind::InsufficientFundsDecline => {
                (self.insufficient_funds_decline, FeeSettlement::ProviderCharge)
            }
        };
        let (rounded, exact_positive) = rule.apply(amount);

        match settlement {
            FeeSettlement::ProviderCharge if rounded > 0 => FeeQuote {
                fee: rounded,
                requires_charge: true,
            },
            FeeSettlement::ProviderCharge if exact_positive => FeeQuote {
                fee: 1,
                requires_charge: true,
            },
            FeeSettlement::Inline if rounded > 0 => FeeQuote {
                fee: rounded,
                requires_charge: false,
            },
            _ => FeeQuote::NONE,
        }
    }
}

/// Whether a line still owes an external fee charge.
///
/// Only successful deposits and declined spends carry collectable fees.
pub fn fee_due(line: &CardTransaction) -> bool {
    if line.fee <= 0 || line.fee_settled {
        return false;
    }
    matches!(
        (line.kind, line.status),
        (TransactionKind::Deposit, CardTransactionStatus::Successful)
            | (TransactionKind::Spend, CardTransactionStatus::Declined)
    )
}

/// Result of one collection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeeCollection {
    NotDue,
    Settled { provider_ref: String },
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeRetrySummary {
    pub attempted: usize,
    pub settled: usize,
    pub failed: usize,
}

/// Collects quoted fees through the provider.
pub struct FeeService {
    store: Arc<dyn EntityStore>,
    provider: Arc<dyn CardProvider>,
    schedule: FeeSchedule,
}

impl FeeService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        provider: Arc<dyn CardProvider>,
        schedule: FeeSchedule,
    ) -> Self {
        Self {
            store,
            provider,
            schedule,
        }
    }

    pub fn schedule(&self) -> &FeeSchedule {
        &self.schedule
    }

    /// Charge the fee recorded on a committed line.
    ///
    /// Best-effort: a failed charge is logged and the line stays unsettled.
    pub async fn collect(&self, line: &CardTransaction, provider_user_ref: &str) -> FeeCollection {
        if !fee_due(line) {
            return FeeCollection::NotDue;
        }

        let kind = match line.kind {
            TransactionKind::Deposit => FeeKind::Deposit,
            TransactionKind::Spend => FeeKind::InsufficientFundsDecline,
        };
        let description = format!("{} for {}", kind.description(), line.provider_ref);
        let idempotency_key = format!("fee:{}", line.provider_ref);

        let receipt = match self
            .provider
            .create_charge(provider_user_ref, line.fee, &description, &idempotency_key)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::warn!(
                    transaction_ref = %line.provider_ref,
                    fee = line.fee,
                    error = %e,
                    "Fee charge failed, left unsettled"
                );
                return FeeCollection::Failed;
            }
        };

        // The charge is idempotent, so a failed mark is repaired by the next sweep.
        if let Err(e) = self
            .store
            .mark_fee_settled(line.id, Some(&receipt.provider_ref))
            .await
        {
            tracing::error!(
                transaction_ref = %line.provider_ref,
                charge_ref = %receipt.provider_ref,
                error = %e,
                "Fee charged but settlement could not be recorded"
            );
            return FeeCollection::Failed;
        }

        tracing::info!(
            transaction_ref = %line.provider_ref,
            fee = line.fee,
            charge_ref = %receipt.provider_ref,
            "Fee settled"
        );
        FeeCollection::Settled {
            provider_ref: receipt.provider_ref,
        }
    }

    /// Re-attempt charges for unsettled lines, oldest first.
    pub async fn retry_unsettled(&self, batch_size: i64) -> Result<FeeRetrySummary, StoreError> {
        let mut summary = FeeRetrySummary::default();

        for line in self.store.find_unsettled_fees(batch_size).await? {
            let Some(card_user) = self.store.find_card_user_by_id(line.card_user_id).await? else {
                tracing::warn!(
                    transaction_ref = %line.provider_ref,
                    card_user_id = %line.card_user_id,
                    "Unsettled fee has no card user, skipped"
                );
                continue;
            };

            summary.attempted += 1;
            match self.collect(&line, &card_user.provider_ref).await {
                FeeCollection::Settled { .. } => summary.settled += 1,
                FeeCollection::Failed => summary.failed += 1,
                FeeCollection::NotDue => {}
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memory::MemoryStore,
        test_support::{MockProvider, card_fixture, card_user_fixture, new_line, seed_line},
    };

    fn schedule(settlement: FeeSettlement) -> FeeSchedule {
        FeeSchedule {
            deposit: FeeRule {
                bps: 100,
                flat_minor: 0,
            },
            insufficient_funds_decline: FeeRule::flat(50),
            settlement,
        }
    }

    #[test]
    fn deposit_fee_is_rounded_basis_points() {
        let fees = schedule(FeeSettlement::ProviderCharge);
        assert_eq!(fees.quote(FeeKind::Deposit, 10_000).fee, 100);
        assert_eq!(fees.quote(FeeKind::Deposit, 10_050).fee, 101);
        assert_eq!(fees.quote(FeeKind::Deposit, 10_049).fee, 100);
    }

    #[test]
    fn sub_unit_fee_becomes_one_unit_only_when_charged() {
        let charged = schedule(FeeSettlement::ProviderCharge).quote(FeeKind::Deposit, 20);
        assert_eq!(
            charged,
            FeeQuote {
                fee: 1,
                requires_charge: true
            }
        );

        let inline = schedule(FeeSettlement::Inline).quote(FeeKind::Deposit, 20);
        assert_eq!(inline, FeeQuote::NONE);
        assert!(inline.settled_on_write());
    }

    #[test]
    fn zero_rule_quotes_nothing() {
        let fees = FeeSchedule::default();
        assert_eq!(fees.quote(FeeKind::Deposit, 10_000), FeeQuote::NONE);
        assert_eq!(fees.quote(FeeKind::InsufficientFundsDecline, 0), FeeQuote::NONE);
    }

    #[test]
    fn decline_fee_is_flat() {
        let fees = schedule(FeeSettlement::ProviderCharge);
        assert_eq!(fees.quote(FeeKind::InsufficientFundsDecline, 0).fee, 50);
        assert_eq!(fees.quote(FeeKind::InsufficientFundsDecline, 99_999).fee, 50);
    }

    #[test]
    fn decline_fee_is_charged_externally_even_in_inline_mode() {
        let fees = schedule(FeeSettlement::Inline);

        let decline = fees.quote(FeeKind::InsufficientFundsDecline, 2_500);
        assert_eq!(
            decline,
            FeeQuote {
                fee: 50,
                requires_charge: true
            }
        );
        assert!(!decline.settled_on_write());

        assert!(!fees.quote(FeeKind::Deposit, 10_000).requires_charge);
    }

    #[tokio::test]
    async fn only_terminal_fee_bearing_lines_are_due() {
        let store = MemoryStore::new();
        let user = card_user_fixture(0);
        let card = card_fixture(&user, 0);

        let pending = seed_line(
            &store,
            new_line(&card, "dep_pending", TransactionKind::Deposit, CardTransactionStatus::Pending, 10_000, 100),
        )
        .await;
        let done = seed_line(
            &store,
            new_line(&card, "dep_done", TransactionKind::Deposit, CardTransactionStatus::Successful, 10_000, 100),
        )
        .await;
        let declined = seed_line(
            &store,
            new_line(&card, "spend_declined", TransactionKind::Spend, CardTransactionStatus::Declined, 0, 50),
        )
        .await;
        let spent = seed_line(
            &store,
            new_line(&card, "spend_ok", TransactionKind::Spend, CardTransactionStatus::Successful, 500, 5),
        )
        .await;

        assert!(!fee_due(&pending));
        assert!(fee_due(&done));
        assert!(fee_due(&declined));
        assert!(!fee_due(&spent));
    }

    #[tokio::test]
    async fn collect_marks_line_settled_with_charge_reference() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let user = card_user_fixture(0);
        let card = card_fixture(&user, 0);
        let line = seed_line(
            &store,
            new_line(&card, "dep_1", TransactionKind::Deposit, CardTransactionStatus::Successful, 10_000, 100),
        )
        .await;

        let service = FeeService::new(
            store.clone(),
            provider.clone(),
            schedule(FeeSettlement::ProviderCharge),
        );
        let outcome = service.collect(&line, &user.provider_ref).await;

        assert!(matches!(outcome, FeeCollection::Settled { .. }));
        let charges = provider.charges();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].amount_minor, 100);
        assert_eq!(charges[0].idempotency_key, "fee:dep_1");

        let stored = store.card_transaction("dep_1").await.unwrap();
        assert!(stored.fee_settled);
        assert_eq!(stored.fee_provider_ref.as_deref(), Some("chg_1"));
    }

    #[tokio::test]
    async fn failed_charge_is_retried_by_the_sweep() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let user = card_user_fixture(0);
        store.insert_card_user(user.clone()).await;
        let card = card_fixture(&user, 0);
        let line = seed_line(
            &store,
            new_line(&card, "dep_1", TransactionKind::Deposit, CardTransactionStatus::Successful, 10_000, 100),
        )
        .await;

        let service = FeeService::new(
            store.clone(),
            provider.clone(),
            schedule(FeeSettlement::ProviderCharge),
        );

        provider.fail_calls(true);
        assert_eq!(service.collect(&line, &user.provider_ref).await, FeeCollection::Failed);
        assert!(!store.card_transaction("dep_1").await.unwrap().fee_settled);

        provider.fail_calls(false);
        let summary = service.retry_unsettled(10).await.unwrap();
        assert_eq!(
            summary,
            FeeRetrySummary {
                attempted: 1,
                settled: 1,
                failed: 0
            }
        );
        assert!(store.card_transaction("dep_1").await.unwrap().fee_settled);

        let summary = service.retry_unsettled(10).await.unwrap();
        assert_eq!(summary.attempted, 0);
    }
}
