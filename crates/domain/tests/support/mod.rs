//! A small bank account aggregate used across the repository tests.

use common::AggregateId;
use domain::{Aggregate, DomainEvent, SnapshotCapable};
use event_store::Version;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AccountEvent {
    Opened { id: AggregateId, owner: String },
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::Opened { .. } => "AccountOpened",
            AccountEvent::Deposited { .. } => "MoneyDeposited",
            AccountEvent::Withdrawn { .. } => "MoneyWithdrawn",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("account already open")]
    AlreadyOpen,
    #[error("account not open")]
    NotOpen,
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Option<AggregateId>,
    pub owner: String,
    pub balance: i64,
    pub transactions: u64,
    #[serde(skip)]
    pub version: Version,
}

impl Aggregate for Account {
    type Event = AccountEvent;
    type Error = AccountError;

    fn aggregate_type() -> &'static str {
        "Account"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: AccountEvent) {
        match event {
            AccountEvent::Opened { id, owner } => {
                self.id = Some(id);
                self.owner = owner;
            }
            AccountEvent::Deposited { amount } => {
                self.balance += amount;
                self.transactions += 1;
            }
            AccountEvent::Withdrawn { amount } => {
                self.balance -= amount;
                self.transactions += 1;
            }
        }
    }
}

impl SnapshotCapable for Account {}

impl Account {
    pub fn open(&self, id: AggregateId, owner: &str) -> Result<Vec<AccountEvent>, AccountError> {
        if self.id.is_some() {
            return Err(AccountError::AlreadyOpen);
        }
        Ok(vec![AccountEvent::Opened {
            id,
            owner: owner.to_string(),
        }])
    }

    pub fn deposit(&self, amount: i64) -> Result<Vec<AccountEvent>, AccountError> {
        if self.id.is_none() {
            return Err(AccountError::NotOpen);
        }
        Ok(vec![AccountEvent::Deposited { amount }])
    }

    pub fn withdraw(&self, amount: i64) -> Result<Vec<AccountEvent>, AccountError> {
        if self.id.is_none() {
            return Err(AccountError::NotOpen);
        }
        if amount > self.balance {
            return Err(AccountError::InsufficientFunds {
                balance: self.balance,
                requested: amount,
            });
        }
        Ok(vec![AccountEvent::Withdrawn { amount }])
    }
}
