//! Resolution of groups into their qualifying address sets.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ethers::types::Address;
use log::{debug, info};
use tokio::task::JoinSet;

use crate::error::{IndexerError, LedgerError};
use crate::ethereum::MINT_SENTINEL;
use crate::indexer::ledger::{early_holders, BalanceLedger};
use crate::storage::CredentialStorage;
use crate::types::{Group, MemberSelectionRule, TransferEvent};

/// Address sets derived from one contract's event log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractSets {
    pub whales: BTreeSet<Address>,
    pub early_holders: Vec<Address>,
}

impl ContractSets {
    /// Replays the ordered log once and derives every set from it.
    pub fn derive(contract_id: &str, events: &[TransferEvent]) -> Result<Self, LedgerError> {
        let ledger = BalanceLedger::replay(contract_id, events)?;
        Ok(Self {
            whales: ledger.whales().clone(),
            early_holders: early_holders(events),
        })
    }
}

/// Canonical member list: deduplicated, sentinel removed, ascending.
pub fn canonical_members(addresses: impl IntoIterator<Item = Address>) -> Vec<Address> {
    addresses
        .into_iter()
        .filter(|a| *a != MINT_SENTINEL)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Members of one rule given the sets of the contracts it may reference.
pub fn members_for(
    rule: &MemberSelectionRule,
    sets: &HashMap<String, ContractSets>,
) -> Result<Vec<Address>, IndexerError> {
    let lookup = |contract: &str| {
        sets.get(contract).ok_or_else(|| IndexerError::Unknown {
            kind: "contract",
            id: contract.to_string(),
        })
    };
    Ok(match rule {
        MemberSelectionRule::Whale { contract } => {
            canonical_members(lookup(contract)?.whales.iter().copied())
        }
        MemberSelectionRule::EarlyHolder { contract } => {
            canonical_members(lookup(contract)?.early_holders.iter().copied())
        }
        MemberSelectionRule::Static { addresses } => canonical_members(addresses.iter().copied()),
    })
}

/// Resolves every group, replaying each referenced contract once.
///
/// Contracts replay in parallel on the blocking pool; a contract's own replay
/// is sequential. The first failure aborts the whole resolution.
pub async fn resolve_groups(
    storage: Arc<dyn CredentialStorage>,
    groups: &[Group],
) -> Result<Vec<(Group, Vec<Address>)>, IndexerError> {
    let contracts: BTreeSet<String> = groups
        .iter()
        .filter_map(|g| g.rule.contract().map(str::to_string))
        .collect();

    let mut tasks = JoinSet::new();
    for contract in contracts {
        let storage = Arc::clone(&storage);
        tasks.spawn(async move {
            let events = storage.events(&contract).await?;
            debug!("Replaying {} events of {}", events.len(), contract);
            let sets = tokio::task::spawn_blocking({
                let contract = contract.clone();
                move || ContractSets::derive(&contract, &events)
            })
            .await
            .map_err(|e| IndexerError::Task(e.to_string()))??;
            Ok::<_, IndexerError>((contract, sets))
        });
    }

    let mut sets = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (contract, contract_sets) = joined.map_err(|e| IndexerError::Task(e.to_string()))??;
        info!(
            "Contract {}: {} whales, {} early holders",
            contract,
            contract_sets.whales.len(),
            contract_sets.early_holders.len()
        );
        sets.insert(contract, contract_sets);
    }

    groups
        .iter()
        .map(|group| Ok((group.clone(), members_for(&group.rule, &sets)?)))
        .collect()
}
