//! Balance replay for one contract.
//!
//! Events must be applied strictly in `(block, tx index, log index)` order;
//! the ledger refuses anything else. Balances never go negative for
//! non-sentinel addresses: a transfer that would do so aborts the replay.

use std::collections::{BTreeSet, HashMap, HashSet};

use ethers::types::{Address, U256};
use log::error;

use crate::error::LedgerError;
use crate::ethereum::MINT_SENTINEL;
use crate::types::{Balance, EventKey, TransferEvent};

/// Whales hold more than `total_supply / WHALE_DIVISOR`.
pub const WHALE_DIVISOR: u64 = 1000;

/// Early holders are the first `EARLY_HOLDER_PERCENT`% of distinct recipients.
pub const EARLY_HOLDER_PERCENT: usize = 5;

#[derive(Debug, Clone)]
pub struct BalanceLedger {
    contract_id: String,
    balances: HashMap<Address, (U256, u64)>,
    total_supply: U256,
    whales: BTreeSet<Address>,
    last_key: Option<EventKey>,
}

impl BalanceLedger {
    pub fn new(contract_id: impl Into<String>) -> Self {
        Self {
            contract_id: contract_id.into(),
            balances: HashMap::new(),
            total_supply: U256::zero(),
            whales: BTreeSet::new(),
            last_key: None,
        }
    }

    /// Replays a full, ordered event log.
    pub fn replay(contract_id: &str, events: &[TransferEvent]) -> Result<Self, LedgerError> {
        let mut ledger = Self::new(contract_id);
        for event in events {
            ledger.apply(event)?;
        }
        Ok(ledger)
    }

    /// Applies one transfer.
    ///
    /// Mints (`from` is the sentinel) grow the supply, burns (`to` is the
    /// sentinel) shrink it. After the transfer the recipient joins the whale
    /// set if its balance exceeds the current threshold; whales are never
    /// removed.
    pub fn apply(&mut self, event: &TransferEvent) -> Result<(), LedgerError> {
        let key = event.key();
        if self.last_key.is_some_and(|last| key <= last) {
            return Err(LedgerError::OutOfOrder {
                contract: self.contract_id.clone(),
                block: event.block_number,
                tx_index: event.tx_index,
                log_index: event.log_index,
            });
        }

        if event.from == MINT_SENTINEL {
            self.total_supply = self
                .total_supply
                .checked_add(event.value)
                .ok_or_else(|| self.overflow(event))?;
        } else {
            let balance = self.balance_of(&event.from);
            let Some(remaining) = balance.checked_sub(event.value) else {
                error!(
                    "Negative balance for {:?} in {} at block {}: has {}, sends {}",
                    event.from, self.contract_id, event.block_number, balance, event.value
                );
                return Err(LedgerError::NegativeBalance {
                    contract: self.contract_id.clone(),
                    address: event.from,
                    balance,
                    value: event.value,
                    block: event.block_number,
                });
            };
            self.balances
                .insert(event.from, (remaining, event.block_number));
        }

        if event.to == MINT_SENTINEL {
            let Some(supply) = self.total_supply.checked_sub(event.value) else {
                error!(
                    "Burn of {} exceeds supply {} in {} at block {}",
                    event.value, self.total_supply, self.contract_id, event.block_number
                );
                return Err(LedgerError::SupplyUnderflow {
                    contract: self.contract_id.clone(),
                    supply: self.total_supply,
                    value: event.value,
                    block: event.block_number,
                });
            };
            self.total_supply = supply;
        } else {
            let credited = self
                .balance_of(&event.to)
                .checked_add(event.value)
                .ok_or_else(|| self.overflow(event))?;
            self.balances.insert(event.to, (credited, event.block_number));
            if credited > self.whale_threshold() {
                self.whales.insert(event.to);
            }
        }

        self.last_key = Some(key);
        Ok(())
    }

    fn overflow(&self, event: &TransferEvent) -> LedgerError {
        LedgerError::Overflow {
            contract: self.contract_id.clone(),
            block: event.block_number,
        }
    }

    pub fn contract_id(&self) -> &str {
        &self.contract_id
    }

    pub fn last_key(&self) -> Option<EventKey> {
        self.last_key
    }

    pub fn total_supply(&self) -> U256 {
        self.total_supply
    }

    pub fn whale_threshold(&self) -> U256 {
        self.total_supply / U256::from(WHALE_DIVISOR)
    }

    pub fn balance_of(&self, address: &Address) -> U256 {
        self.balances
            .get(address)
            .map(|(balance, _)| *balance)
            .unwrap_or_default()
    }

    pub fn balance(&self, address: &Address) -> Option<Balance> {
        self.balances
            .get(address)
            .map(|&(balance, last_updated_block)| Balance {
                contract_id: self.contract_id.clone(),
                address: *address,
                balance,
                last_updated_block,
            })
    }

    pub fn holders(&self) -> usize {
        self.balances.values().filter(|(b, _)| !b.is_zero()).count()
    }

    /// Every address ever flagged as a whale during this replay, sorted.
    pub fn whales(&self) -> &BTreeSet<Address> {
        &self.whales
    }

    pub fn is_whale(&self, address: &Address) -> bool {
        self.whales.contains(address)
    }
}

/// The first 5% of distinct recipients, in first-received order.
///
/// `events` must already be in replay order. At least one address is
/// returned whenever there is any recipient.
pub fn early_holders(events: &[TransferEvent]) -> Vec<Address> {
    let mut seen = HashSet::new();
    let recipients: Vec<Address> = events
        .iter()
        .map(|e| e.to)
        .filter(|to| *to != MINT_SENTINEL && seen.insert(*to))
        .collect();

    let count = (recipients.len() * EARLY_HOLDER_PERCENT).div_ceil(100);
    recipients.into_iter().take(count).collect()
}
