//! Double-entry ledger: financial accounts, transfer log, pending transfers.
//!
//! Every money move creates exactly one [`MoneyTransfer`] record plus one
//! transaction entry on each of the two affected accounts. Balances are
//! derived state kept alongside the logs; because every completed transfer
//! debits one account and credits another by the same amount, the sum of all
//! balances is zero at all times.
//!
//! Money entering the platform from outside (wallet top-ups) is modelled as
//! a transfer from the `external` party, whose balance is allowed to go
//! negative — keeping the zero-sum invariant without special cases.
//!
//! A transfer whose source lacks funds can be *deferred*: it is recorded as
//! `pending` with no account mutation, and the payment worker retries it
//! periodically until the source balance permits settlement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Vocabulary
// ============================================================================

/// Which side of the platform an account belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Captain,
    Passenger,
    House,
    /// The world outside the ledger (top-ups, payouts). May go negative.
    External,
}

impl PartyRole {
    /// The account kind a role's money lives in.
    pub fn account_kind(self) -> AccountKind {
        match self {
            Self::Captain | Self::Passenger => AccountKind::Wallet,
            Self::House | Self::External => AccountKind::Vault,
        }
    }

    /// Whether this party may be debited below zero.
    fn may_overdraw(self) -> bool {
        matches!(self, Self::External)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Wallet,
    Vault,
}

impl std::fmt::Display for AccountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wallet => write!(f, "wallet"),
            Self::Vault => write!(f, "vault"),
        }
    }
}

/// One side of a transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Party {
    pub id: String,
    pub role: PartyRole,
}

impl Party {
    pub fn captain(id: &str) -> Self {
        Self { id: id.to_owned(), role: PartyRole::Captain }
    }

    pub fn passenger(id: &str) -> Self {
        Self { id: id.to_owned(), role: PartyRole::Passenger }
    }

    pub fn house() -> Self {
        Self { id: "house".to_owned(), role: PartyRole::House }
    }

    pub fn external() -> Self {
        Self { id: "external".to_owned(), role: PartyRole::External }
    }

    fn account_key(&self) -> String {
        format!("{}:{}", self.id, self.role.account_kind())
    }
}

/// Why money moved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Acceptance-time deduction from the captain wallet to the house vault.
    VaultDeduction,
    /// Rollback of a vault deduction after a lost acceptance race.
    VaultDeductionRefund,
    /// Completion-time company commission.
    Commission,
    /// Completion-time excess payment returned to the passenger.
    Overage,
    /// External money loaded onto a wallet.
    Topup,
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VaultDeduction => write!(f, "vault_deduction"),
            Self::VaultDeductionRefund => write!(f, "vault_deduction_refund"),
            Self::Commission => write!(f, "commission"),
            Self::Overage => write!(f, "overage"),
            Self::Topup => write!(f, "topup"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Completed,
}

/// The transfer log record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MoneyTransfer {
    pub id: String,
    pub from: Party,
    pub to: Party,
    pub amount: i64,
    pub kind: TransferKind,
    pub status: TransferStatus,
    /// Trip that caused the move, when there is one.
    #[serde(default)]
    pub trip_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
}

/// Direction of a transaction entry relative to its account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryDirection {
    Debit,
    Credit,
}

/// One line in an account's append-only transaction log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
    pub transfer_id: String,
    pub counterparty: Party,
    pub direction: EntryDirection,
    pub amount: i64,
    pub kind: TransferKind,
    pub at: DateTime<Utc>,
}

/// Persisted account document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub owner: Party,
    pub balance: i64,
    pub transactions: Vec<TransactionEntry>,
}

impl Account {
    fn new(owner: Party) -> Self {
        Self { owner, balance: 0, transactions: Vec::new() }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("transfer amount must be positive, got {0}")]
    NonPositiveAmount(i64),
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Sled-backed double-entry ledger.
///
/// All mutation is serialized through one mutex: transfers touch two account
/// documents plus the transfer log, and the volume (one move per acceptance
/// or completion) is nowhere near the point where that lock matters.
pub struct Ledger {
    accounts: sled::Tree,
    transfers: sled::Tree,
    pending: sled::Tree,
    write_lock: std::sync::Mutex<()>,
}

impl Ledger {
    pub fn new(accounts: sled::Tree, transfers: sled::Tree, pending: sled::Tree) -> Self {
        Self {
            accounts,
            transfers,
            pending,
            write_lock: std::sync::Mutex::new(()),
        }
    }

    /// Current balance of a party's account (zero if never touched).
    pub fn balance(&self, party: &Party) -> Result<i64, LedgerError> {
        Ok(self.load_account(party)?.balance)
    }

    /// Full transaction history of a party's account, oldest first.
    pub fn history(&self, party: &Party) -> Result<Vec<TransactionEntry>, LedgerError> {
        Ok(self.load_account(party)?.transactions)
    }

    /// Move `amount` from `from` to `to`, failing when the source balance is
    /// insufficient (unless the source may overdraw).
    pub fn transfer(
        &self,
        from: &Party,
        to: &Party,
        amount: i64,
        kind: TransferKind,
        trip_id: Option<&str>,
    ) -> Result<MoneyTransfer, LedgerError> {
        let _guard = self.lock();
        self.settle_new(from, to, amount, kind, trip_id)
    }

    /// Move `amount` without the source balance check, letting the source
    /// go negative. Used for commission claims against cash fares the
    /// captain already holds outside the ledger.
    pub fn transfer_unchecked(
        &self,
        from: &Party,
        to: &Party,
        amount: i64,
        kind: TransferKind,
        trip_id: Option<&str>,
    ) -> Result<MoneyTransfer, LedgerError> {
        let _guard = self.lock();
        if amount <= 0 {
            return Err(LedgerError::NonPositiveAmount(amount));
        }
        let transfer_id = Uuid::new_v4().to_string();
        self.apply_unchecked(from, to, amount, kind, &transfer_id)?;
        let transfer = MoneyTransfer {
            id: transfer_id,
            from: from.clone(),
            to: to.clone(),
            amount,
            kind,
            status: TransferStatus::Completed,
            trip_id: trip_id.map(ToOwned::to_owned),
            created_at: Utc::now(),
            settled_at: Some(Utc::now()),
        };
        self.store_transfer(&transfer)?;
        debug!(
            transfer_id = %transfer.id,
            from = %from.id,
            to = %to.id,
            amount = amount,
            kind = %kind,
            "Transfer completed (overdraw permitted)"
        );
        Ok(transfer)
    }

    /// Like [`transfer`](Self::transfer), but an insufficient source records
    /// the move as `pending` instead of failing. The payment worker retries
    /// pending transfers until the balance permits.
    pub fn transfer_or_defer(
        &self,
        from: &Party,
        to: &Party,
        amount: i64,
        kind: TransferKind,
        trip_id: Option<&str>,
    ) -> Result<MoneyTransfer, LedgerError> {
        let _guard = self.lock();
        match self.settle_new(from, to, amount, kind, trip_id) {
            Err(LedgerError::InsufficientFunds { balance, .. }) => {
                let transfer = MoneyTransfer {
                    id: Uuid::new_v4().to_string(),
                    from: from.clone(),
                    to: to.clone(),
                    amount,
                    kind,
                    status: TransferStatus::Pending,
                    trip_id: trip_id.map(ToOwned::to_owned),
                    created_at: Utc::now(),
                    settled_at: None,
                };
                self.store_transfer(&transfer)?;
                self.pending.insert(transfer.id.as_bytes(), &[] as &[u8])?;
                warn!(
                    transfer_id = %transfer.id,
                    from = %from.id,
                    to = %to.id,
                    amount = amount,
                    balance = balance,
                    kind = %kind,
                    "Transfer deferred: insufficient source balance"
                );
                Ok(transfer)
            }
            other => other,
        }
    }

    /// All transfers currently waiting on source balance.
    pub fn pending_transfers(&self) -> Result<Vec<MoneyTransfer>, LedgerError> {
        let mut out = Vec::new();
        for entry in self.pending.iter() {
            let (id_bytes, _) = entry?;
            let id = String::from_utf8_lossy(&id_bytes).into_owned();
            match self.load_transfer(&id)? {
                Some(transfer) => out.push(transfer),
                // Dangling pending marker; drop it.
                None => {
                    self.pending.remove(&id_bytes)?;
                }
            }
        }
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    /// Attempt to settle one pending transfer. Returns whether it settled.
    pub fn settle_pending(&self, transfer_id: &str) -> Result<bool, LedgerError> {
        let _guard = self.lock();
        let mut transfer = self
            .load_transfer(transfer_id)?
            .ok_or_else(|| LedgerError::UnknownTransfer(transfer_id.to_owned()))?;
        if transfer.status == TransferStatus::Completed {
            self.pending.remove(transfer_id.as_bytes())?;
            return Ok(true);
        }
        match self.apply_balanced(&transfer.from, &transfer.to, transfer.amount, transfer.kind, transfer_id) {
            Ok(()) => {
                transfer.status = TransferStatus::Completed;
                transfer.settled_at = Some(Utc::now());
                self.store_transfer(&transfer)?;
                self.pending.remove(transfer_id.as_bytes())?;
                info!(
                    transfer_id = %transfer_id,
                    amount = transfer.amount,
                    kind = %transfer.kind,
                    "Pending transfer settled"
                );
                Ok(true)
            }
            Err(LedgerError::InsufficientFunds { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Sum of every account balance. Zero unless the ledger is corrupt.
    pub fn balance_sum(&self) -> Result<i64, LedgerError> {
        let mut sum = 0i64;
        for entry in self.accounts.iter() {
            let (_, bytes) = entry?;
            let account: Account = serde_json::from_slice(&bytes)?;
            sum += account.balance;
        }
        Ok(sum)
    }

    // ------------------------------------------------------------------
    // internals (callers hold the write lock where required)
    // ------------------------------------------------------------------

    fn settle_new(
        &self,
        from: &Party,
        to: &Party,
        amount: i64,
        kind: TransferKind,
        trip_id: Option<&str>,
    ) -> Result<MoneyTransfer, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::NonPositiveAmount(amount));
        }
        let transfer_id = Uuid::new_v4().to_string();
        self.apply_balanced(from, to, amount, kind, &transfer_id)?;
        let transfer = MoneyTransfer {
            id: transfer_id,
            from: from.clone(),
            to: to.clone(),
            amount,
            kind,
            status: TransferStatus::Completed,
            trip_id: trip_id.map(ToOwned::to_owned),
            created_at: Utc::now(),
            settled_at: Some(Utc::now()),
        };
        self.store_transfer(&transfer)?;
        debug!(
            transfer_id = %transfer.id,
            from = %from.id,
            to = %to.id,
            amount = amount,
            kind = %kind,
            "Transfer completed"
        );
        Ok(transfer)
    }

    /// Debit `from` and credit `to`, writing one entry on each log.
    fn apply_balanced(
        &self,
        from: &Party,
        to: &Party,
        amount: i64,
        kind: TransferKind,
        transfer_id: &str,
    ) -> Result<(), LedgerError> {
        let src = self.load_account(from)?;
        if !from.role.may_overdraw() && src.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                balance: src.balance,
                required: amount,
            });
        }
        self.apply_unchecked(from, to, amount, kind, transfer_id)
    }

    /// The unguarded double entry shared by checked and overdraw paths.
    fn apply_unchecked(
        &self,
        from: &Party,
        to: &Party,
        amount: i64,
        kind: TransferKind,
        transfer_id: &str,
    ) -> Result<(), LedgerError> {
        let mut src = self.load_account(from)?;
        let mut dst = self.load_account(to)?;
        let at = Utc::now();

        src.balance -= amount;
        src.transactions.push(TransactionEntry {
            transfer_id: transfer_id.to_owned(),
            counterparty: to.clone(),
            direction: EntryDirection::Debit,
            amount,
            kind,
            at,
        });
        dst.balance += amount;
        dst.transactions.push(TransactionEntry {
            transfer_id: transfer_id.to_owned(),
            counterparty: from.clone(),
            direction: EntryDirection::Credit,
            amount,
            kind,
            at,
        });

        self.store_account(&src)?;
        self.store_account(&dst)?;
        Ok(())
    }

    fn load_account(&self, party: &Party) -> Result<Account, LedgerError> {
        match self.accounts.get(party.account_key().as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Account::new(party.clone())),
        }
    }

    fn store_account(&self, account: &Account) -> Result<(), LedgerError> {
        let key = account.owner.account_key();
        self.accounts
            .insert(key.as_bytes(), serde_json::to_vec(account)?)?;
        Ok(())
    }

    fn load_transfer(&self, transfer_id: &str) -> Result<Option<MoneyTransfer>, LedgerError> {
        match self.transfers.get(transfer_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store_transfer(&self, transfer: &MoneyTransfer) -> Result<(), LedgerError> {
        self.transfers
            .insert(transfer.id.as_bytes(), serde_json::to_vec(transfer)?)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        std::mem::forget(dir);
        Ledger::new(
            db.open_tree("accounts").unwrap(),
            db.open_tree("transfers").unwrap(),
            db.open_tree("pending").unwrap(),
        )
    }

    fn topup(ledger: &Ledger, captain: &str, amount: i64) {
        ledger
            .transfer(
                &Party::external(),
                &Party::captain(captain),
                amount,
                TransferKind::Topup,
                None,
            )
            .unwrap();
    }

    #[test]
    fn transfer_moves_balance_and_stays_zero_sum() {
        let ledger = ledger();
        topup(&ledger, "c1", 10_000);
        ledger
            .transfer(
                &Party::captain("c1"),
                &Party::house(),
                1000,
                TransferKind::VaultDeduction,
                Some("t1"),
            )
            .unwrap();
        assert_eq!(ledger.balance(&Party::captain("c1")).unwrap(), 9000);
        assert_eq!(ledger.balance(&Party::house()).unwrap(), 1000);
        assert_eq!(ledger.balance_sum().unwrap(), 0);
    }

    #[test]
    fn insufficient_source_fails_without_mutation() {
        let ledger = ledger();
        topup(&ledger, "c1", 500);
        let err = ledger
            .transfer(
                &Party::captain("c1"),
                &Party::house(),
                1000,
                TransferKind::VaultDeduction,
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { balance: 500, required: 1000 }
        ));
        assert_eq!(ledger.balance(&Party::captain("c1")).unwrap(), 500);
        assert_eq!(ledger.balance(&Party::house()).unwrap(), 0);
    }

    #[test]
    fn deferred_transfer_settles_once_funded() {
        let ledger = ledger();
        topup(&ledger, "c1", 200);
        let transfer = ledger
            .transfer_or_defer(
                &Party::captain("c1"),
                &Party::passenger("p1"),
                500,
                TransferKind::Overage,
                Some("t1"),
            )
            .unwrap();
        assert_eq!(transfer.status, TransferStatus::Pending);
        assert_eq!(ledger.balance(&Party::passenger("p1")).unwrap(), 0);
        assert_eq!(ledger.pending_transfers().unwrap().len(), 1);

        // Still short: settle attempt is a no-op.
        assert!(!ledger.settle_pending(&transfer.id).unwrap());

        topup(&ledger, "c1", 1000);
        assert!(ledger.settle_pending(&transfer.id).unwrap());
        assert_eq!(ledger.balance(&Party::passenger("p1")).unwrap(), 500);
        assert_eq!(ledger.balance(&Party::captain("c1")).unwrap(), 700);
        assert!(ledger.pending_transfers().unwrap().is_empty());
        assert_eq!(ledger.balance_sum().unwrap(), 0);
    }

    #[test]
    fn both_accounts_log_the_same_transfer() {
        let ledger = ledger();
        topup(&ledger, "c1", 5000);
        let transfer = ledger
            .transfer(
                &Party::captain("c1"),
                &Party::house(),
                750,
                TransferKind::Commission,
                Some("t9"),
            )
            .unwrap();
        let src = ledger.history(&Party::captain("c1")).unwrap();
        let dst = ledger.history(&Party::house()).unwrap();
        assert!(src
            .iter()
            .any(|e| e.transfer_id == transfer.id && e.direction == EntryDirection::Debit));
        assert!(dst
            .iter()
            .any(|e| e.transfer_id == transfer.id && e.direction == EntryDirection::Credit));
    }

    #[test]
    fn unchecked_transfer_may_overdraw_the_source() {
        let ledger = ledger();
        topup(&ledger, "c1", 200);
        ledger
            .transfer_unchecked(
                &Party::captain("c1"),
                &Party::house(),
                450,
                TransferKind::Commission,
                Some("t1"),
            )
            .unwrap();
        assert_eq!(ledger.balance(&Party::captain("c1")).unwrap(), -250);
        assert_eq!(ledger.balance(&Party::house()).unwrap(), 450);
        assert_eq!(ledger.balance_sum().unwrap(), 0);
    }

    #[test]
    fn non_positive_amount_is_rejected() {
        let ledger = ledger();
        assert!(matches!(
            ledger.transfer(
                &Party::external(),
                &Party::captain("c1"),
                0,
                TransferKind::Topup,
                None
            ),
            Err(LedgerError::NonPositiveAmount(0))
        ));
    }
}
