//! Indexing pipeline: sync contracts, resolve groups, publish trees.
//!
//! Every tracked contract is synced by its own task holding one client from
//! its chain's pool. A failed contract does not stop the others; its error is
//! collected in the [`SyncSummary`].

pub mod groups;
pub mod ledger;
pub mod pool;
pub mod publisher;
pub mod retry;
pub mod rpc;
pub mod syncer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::{IndexerError, SyncError};
use crate::storage::CredentialStorage;
use crate::types::Group;

pub use groups::{canonical_members, resolve_groups, ContractSets};
pub use ledger::{early_holders, BalanceLedger};
pub use pool::{PooledClient, RpcPool};
pub use publisher::{PublishOutcome, Publisher};
pub use retry::{BatchSizer, RetryStrategy};
pub use rpc::{EthersLogProvider, LogProvider};
pub use syncer::{sync_contract, SyncReport};

/// Shared handle to a chain's log provider.
pub type SharedProvider = Arc<dyn LogProvider>;

/// Result of syncing every configured contract once.
#[derive(Debug, Default)]
pub struct SyncSummary {
    pub reports: Vec<SyncReport>,
    pub failures: Vec<(String, SyncError)>,
}

impl SyncSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Indexer {
    config: Arc<Config>,
    storage: Arc<dyn CredentialStorage>,
    pools: HashMap<String, RpcPool<SharedProvider>>,
}

impl Indexer {
    /// Creates one HTTP provider per configured RPC URL.
    pub fn from_config(
        config: Config,
        storage: Arc<dyn CredentialStorage>,
    ) -> Result<Self, IndexerError> {
        let poll = Duration::from_millis(config.sync.pool_wait_poll_ms);
        let mut pools = HashMap::new();
        for chain in &config.chains {
            let urls = chain.resolved_urls()?;
            let clients = urls
                .iter()
                .enumerate()
                .map(|(i, url)| {
                    EthersLogProvider::new(format!("{}#{}", chain.name, i), url)
                        .map(|p| Arc::new(p) as SharedProvider)
                })
                .collect::<Result<Vec<_>, _>>()?;
            info!("Chain {}: {} RPC clients", chain.name, clients.len());
            pools.insert(chain.name.clone(), RpcPool::new(clients, poll)?);
        }
        Ok(Self::with_pools(config, storage, pools))
    }

    pub fn with_pools(
        config: Config,
        storage: Arc<dyn CredentialStorage>,
        pools: HashMap<String, RpcPool<SharedProvider>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            pools,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn CredentialStorage> {
        Arc::clone(&self.storage)
    }

    /// Syncs every configured contract concurrently.
    ///
    /// Concurrency per chain is bounded by that chain's pool capacity.
    pub async fn sync_all(&self) -> Result<SyncSummary, IndexerError> {
        let mut tasks = JoinSet::new();
        for contract in &self.config.contracts {
            let pool = self
                .pools
                .get(&contract.chain)
                .cloned()
                .ok_or_else(|| IndexerError::Unknown {
                    kind: "chain",
                    id: contract.chain.clone(),
                })?;
            let storage = Arc::clone(&self.storage);
            let config = Arc::clone(&self.config);
            let contract = contract.clone();
            tasks.spawn(async move {
                let client = pool.acquire().await;
                let result =
                    sync_contract(&**client, storage.as_ref(), &contract, &config.sync).await;
                client.release();
                (contract.id, result)
            });
        }

        let mut summary = SyncSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let (contract_id, result) = joined.map_err(|e| IndexerError::Task(e.to_string()))?;
            match result {
                Ok(report) => summary.reports.push(report),
                Err(err) => {
                    error!("Sync of {} failed: {}", contract_id, err);
                    summary.failures.push((contract_id, err));
                }
            }
        }
        summary.reports.sort_by(|a, b| a.contract_id.cmp(&b.contract_id));
        Ok(summary)
    }

    /// Resolves every configured group and publishes its tree.
    pub async fn publish_all(&self) -> Result<Vec<PublishOutcome>, IndexerError> {
        self.publish_groups(&self.config.group_list()).await
    }

    async fn publish_groups(&self, groups: &[Group]) -> Result<Vec<PublishOutcome>, IndexerError> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let publisher = Publisher::new(
            Arc::clone(&self.storage),
            &self.config.tree,
            &self.config.bloom,
        )?;
        let resolved = resolve_groups(Arc::clone(&self.storage), groups).await?;

        let mut outcomes = Vec::with_capacity(resolved.len());
        for (group, members) in resolved {
            outcomes.push(publisher.publish(&group, &members).await?);
        }
        Ok(outcomes)
    }

    /// One full cycle. Groups derived from a contract that failed to sync keep
    /// their current version this cycle; every other group is published.
    pub async fn run_once(&self) -> Result<(SyncSummary, Vec<PublishOutcome>), IndexerError> {
        let summary = self.sync_all().await?;
        let failed: HashSet<&str> = summary.failures.iter().map(|(id, _)| id.as_str()).collect();

        let mut held = Vec::new();
        let mut ready = Vec::new();
        for group in self.config.group_list() {
            let blocked = group
                .rule
                .contract()
                .filter(|contract| failed.contains(contract))
                .map(str::to_string);
            match blocked {
                Some(contract) => {
                    warn!(
                        "Holding group {}: contract {} failed to sync",
                        group.id, contract
                    );
                    held.push(PublishOutcome::Skipped {
                        group_id: group.id,
                        reason: format!("contract {contract} failed to sync"),
                    });
                }
                None => ready.push(group),
            }
        }

        let mut outcomes = self.publish_groups(&ready).await?;
        outcomes.extend(held);
        Ok((summary, outcomes))
    }
}
