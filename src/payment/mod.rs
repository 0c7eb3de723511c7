//! Payment interlock: the two ledger touch points of a trip.
//!
//! **At acceptance** — the vault debit: a share of the fare moves from the
//! captain's wallet to the house vault before the acceptance CAS is issued.
//! Insufficient balance refuses the acceptance outright; a lost CAS race
//! afterwards refunds the debit, so the ledger always matches the trip
//! document.
//!
//! **At completion** — settlement: the company commission moves captain to
//! house (overdraw permitted: cash fares live in the captain's pocket, not
//! the wallet), and any overage the passenger handed over moves captain to
//! passenger — deferred as a pending transfer when the wallet is short.
//! The [`pending transfer worker`](run_pending_transfer_worker) retries
//! deferred transfers periodically.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SettingsHandle;
use crate::error::DispatchError;
use crate::store::{Ledger, LedgerError, MoneyTransfer, Party, TransferKind, TransferStatus};
use crate::types::{PaymentClassification, Trip};

/// Outcome of a completion settlement.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub classification: PaymentClassification,
    pub commission: i64,
    /// The overage transfer, when one was owed. May still be pending.
    pub overage: Option<MoneyTransfer>,
}

/// Share computation: fare in minor units times a rate, rounded half-up.
fn share_of(amount: i64, rate: f64) -> i64 {
    (amount as f64 * rate).round() as i64
}

pub struct PaymentInterlock {
    ledger: Arc<Ledger>,
    settings: SettingsHandle,
}

impl PaymentInterlock {
    pub fn new(ledger: Arc<Ledger>, settings: SettingsHandle) -> Self {
        Self { ledger, settings }
    }

    /// The acceptance-time vault debit. Returns the deducted amount.
    ///
    /// Insufficient wallet balance surfaces as
    /// [`DispatchError::InsufficientFunds`] and the acceptance must not
    /// proceed to its CAS.
    pub fn vault_debit(&self, trip: &Trip, captain_id: &str) -> Result<i64, DispatchError> {
        let rate = self.settings.current().main_vault_deduction_rate;
        let debit = share_of(trip.fare.amount, rate);
        if debit == 0 {
            return Ok(0);
        }
        match self.ledger.transfer(
            &Party::captain(captain_id),
            &Party::house(),
            debit,
            TransferKind::VaultDeduction,
            Some(&trip.id),
        ) {
            Ok(_) => {
                info!(
                    trip_id = %trip.id,
                    captain_id = %captain_id,
                    debit = debit,
                    "Vault debit taken at acceptance"
                );
                Ok(debit)
            }
            Err(LedgerError::InsufficientFunds { balance, required }) => {
                Err(DispatchError::InsufficientFunds { balance, required })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Roll the vault debit back after a lost acceptance race.
    pub fn refund_vault_debit(
        &self,
        trip_id: &str,
        captain_id: &str,
        amount: i64,
    ) -> Result<(), DispatchError> {
        if amount == 0 {
            return Ok(());
        }
        self.ledger.transfer_unchecked(
            &Party::house(),
            &Party::captain(captain_id),
            amount,
            TransferKind::VaultDeductionRefund,
            Some(trip_id),
        )?;
        warn!(
            trip_id = %trip_id,
            captain_id = %captain_id,
            amount = amount,
            "Vault debit refunded after lost acceptance race"
        );
        Ok(())
    }

    /// Completion settlement: commission plus overage handling.
    pub fn settle(
        &self,
        trip: &Trip,
        captain_id: &str,
        received: i64,
    ) -> Result<Settlement, DispatchError> {
        let settings = self.settings.current();
        let expected = trip.fare.amount;
        let classification = if received >= expected {
            PaymentClassification::Full
        } else {
            PaymentClassification::Partial
        };

        let commission = share_of(expected, settings.commission_rate);
        if commission > 0 {
            self.ledger.transfer_unchecked(
                &Party::captain(captain_id),
                &Party::house(),
                commission,
                TransferKind::Commission,
                Some(&trip.id),
            )?;
        }

        let overage_amount = received - expected;
        let overage = if overage_amount > 0 {
            let transfer = self.ledger.transfer_or_defer(
                &Party::captain(captain_id),
                &Party::passenger(&trip.passenger_id),
                overage_amount,
                TransferKind::Overage,
                Some(&trip.id),
            )?;
            Some(transfer)
        } else {
            None
        };

        info!(
            trip_id = %trip.id,
            captain_id = %captain_id,
            expected = expected,
            received = received,
            classification = ?classification,
            commission = commission,
            overage_pending = overage
                .as_ref()
                .is_some_and(|t| t.status == TransferStatus::Pending),
            "Payment settled"
        );
        Ok(Settlement { classification, commission, overage })
    }
}

// ============================================================================
// Pending transfer worker
// ============================================================================

/// Periodic retry of deferred transfers. Runs until cancelled; the interval
/// follows `pendingTransferRetrySec` (default five minutes).
pub async fn run_pending_transfer_worker(
    ledger: Arc<Ledger>,
    settings: SettingsHandle,
    cancel: CancellationToken,
) {
    info!("Pending transfer worker started");
    loop {
        let interval = std::time::Duration::from_secs(settings.current().pending_transfer_retry_sec);
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        match retry_pending(&ledger) {
            Ok((settled, remaining)) if settled > 0 || remaining > 0 => {
                info!(settled = settled, remaining = remaining, "Pending transfer sweep");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Pending transfer sweep failed"),
        }
    }
    info!("Pending transfer worker stopped");
}

/// One sweep over the pending set. Returns (settled, still pending).
pub fn retry_pending(ledger: &Ledger) -> Result<(usize, usize), LedgerError> {
    let pending = ledger.pending_transfers()?;
    let mut settled = 0;
    let mut remaining = 0;
    for transfer in pending {
        if ledger.settle_pending(&transfer.id)? {
            settled += 1;
        } else {
            remaining += 1;
            debug!(transfer_id = %transfer.id, amount = transfer.amount, "Transfer still unfunded");
        }
    }
    Ok((settled, remaining))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchSettings;
    use crate::types::{Fare, TripLocation, TripStatus};
    use chrono::Utc;

    fn ledger() -> Arc<Ledger> {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        std::mem::forget(dir);
        Arc::new(Ledger::new(
            db.open_tree("accounts").unwrap(),
            db.open_tree("transfers").unwrap(),
            db.open_tree("pending").unwrap(),
        ))
    }

    fn trip(fare: i64) -> Trip {
        Trip {
            id: "t1".to_owned(),
            passenger_id: "p1".to_owned(),
            passenger_name: None,
            passenger_phone: None,
            driver_id: Some("c1".to_owned()),
            pickup: TripLocation { lat: 33.3, lon: 44.4, name: "A".to_owned() },
            dropoff: TripLocation { lat: 33.35, lon: 44.45, name: "B".to_owned() },
            fare: Fare { amount: fare, currency: "IQD".to_owned() },
            distance_km: 3.0,
            duration_sec: 600,
            status: TripStatus::AwaitingPayment,
            dispatching: false,
            payment_method: "cash".to_owned(),
            created_at: Utc::now(),
            accepted_at: None,
            arrived_at: None,
            started_at: None,
            ended_at: None,
            dispatch_ended_at: None,
            cancellation_reason: None,
            payment_received: None,
            main_vault_deducted: false,
            main_vault_deduction_amount: None,
        }
    }

    fn interlock(ledger: &Arc<Ledger>) -> PaymentInterlock {
        PaymentInterlock::new(ledger.clone(), SettingsHandle::new(DispatchSettings::default()))
    }

    fn topup(ledger: &Ledger, captain: &str, amount: i64) {
        ledger
            .transfer(&Party::external(), &Party::captain(captain), amount, TransferKind::Topup, None)
            .unwrap();
    }

    #[test]
    fn vault_debit_takes_twenty_percent() {
        let ledger = ledger();
        topup(&ledger, "c1", 10_000);
        let debit = interlock(&ledger).vault_debit(&trip(5000), "c1").unwrap();
        assert_eq!(debit, 1000);
        assert_eq!(ledger.balance(&Party::captain("c1")).unwrap(), 9000);
        assert_eq!(ledger.balance(&Party::house()).unwrap(), 1000);
    }

    #[test]
    fn vault_debit_refuses_insufficient_wallet() {
        let ledger = ledger();
        topup(&ledger, "c1", 500);
        let err = interlock(&ledger).vault_debit(&trip(5000), "c1").unwrap_err();
        assert!(matches!(err, DispatchError::InsufficientFunds { balance: 500, required: 1000 }));
        assert_eq!(ledger.balance(&Party::captain("c1")).unwrap(), 500);
    }

    #[test]
    fn refund_restores_the_wallet() {
        let ledger = ledger();
        topup(&ledger, "c1", 2000);
        let interlock = interlock(&ledger);
        let debit = interlock.vault_debit(&trip(5000), "c1").unwrap();
        interlock.refund_vault_debit("t1", "c1", debit).unwrap();
        assert_eq!(ledger.balance(&Party::captain("c1")).unwrap(), 2000);
        assert_eq!(ledger.balance(&Party::house()).unwrap(), 0);
    }

    #[test]
    fn exact_payment_settles_commission_only() {
        let ledger = ledger();
        topup(&ledger, "c1", 10_000);
        let settlement = interlock(&ledger).settle(&trip(3000), "c1", 3000).unwrap();
        assert_eq!(settlement.classification, PaymentClassification::Full);
        assert_eq!(settlement.commission, 450);
        assert!(settlement.overage.is_none());
        assert_eq!(ledger.balance(&Party::house()).unwrap(), 450);
    }

    #[test]
    fn partial_payment_still_settles() {
        let ledger = ledger();
        topup(&ledger, "c1", 10_000);
        let settlement = interlock(&ledger).settle(&trip(3000), "c1", 2999).unwrap();
        assert_eq!(settlement.classification, PaymentClassification::Partial);
        assert!(settlement.overage.is_none());
    }

    #[test]
    fn overage_defers_when_wallet_is_short_then_settles() {
        let ledger = ledger();
        topup(&ledger, "c1", 200);
        // expected 3000, received 3500: commission 450 (overdraws), overage 500 deferred.
        let settlement = interlock(&ledger).settle(&trip(3000), "c1", 3500).unwrap();
        assert_eq!(settlement.commission, 450);
        let overage = settlement.overage.unwrap();
        assert_eq!(overage.status, TransferStatus::Pending);
        assert_eq!(ledger.balance(&Party::passenger("p1")).unwrap(), 0);

        // Fund the wallet; the periodic sweep settles the transfer.
        topup(&ledger, "c1", 1000);
        let (settled, remaining) = retry_pending(&ledger).unwrap();
        assert_eq!((settled, remaining), (1, 0));
        assert_eq!(ledger.balance(&Party::passenger("p1")).unwrap(), 500);
        assert_eq!(ledger.balance_sum().unwrap(), 0);
    }

    #[test]
    fn overage_settles_immediately_when_funded() {
        let ledger = ledger();
        topup(&ledger, "c1", 10_000);
        let settlement = interlock(&ledger).settle(&trip(3000), "c1", 3500).unwrap();
        let overage = settlement.overage.unwrap();
        assert_eq!(overage.status, TransferStatus::Completed);
        assert_eq!(ledger.balance(&Party::passenger("p1")).unwrap(), 500);
    }
}
