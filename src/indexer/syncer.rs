//! Resumable `Transfer` log ingestion for one contract.
//!
//! A run starts after the stored checkpoint (never before the deployment
//! block) and walks to the chain head in adaptive block ranges. Every fetched
//! range is replayed through the contract's ledger before it is written, so
//! an integrity violation stops the run with the checkpoint where it was.

use std::future::Future;

use ethers::types::{Address, U256};
use log::{debug, info, warn};

use crate::config::{ContractConfig, SyncConfig};
use crate::error::{RpcError, SyncError};
use crate::ethereum::parse_address;
use crate::indexer::ledger::BalanceLedger;
use crate::indexer::retry::{BatchSizer, RetryStrategy};
use crate::indexer::rpc::LogProvider;
use crate::storage::CredentialStorage;

/// Outcome of one contract sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub contract_id: String,
    pub from_block: u64,
    pub to_block: u64,
    /// Newly stored events.
    pub events: usize,
    pub total_supply: U256,
    pub whales: usize,
}

/// Runs `op` until it succeeds, fails permanently, or retries run out.
///
/// Only [`RpcError::Transient`] is retried. `ResponseTooLarge` is returned
/// untouched for the caller to shrink the range.
pub async fn with_retry<T, F, Fut>(
    strategy: &RetryStrategy,
    max_retries: u32,
    from_block: u64,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                attempt += 1;
                if attempt > max_retries {
                    return Err(SyncError::RetryExhausted {
                        attempts: attempt,
                        from_block,
                        last_error: err.to_string(),
                    });
                }
                let delay = strategy.delay_for_attempt(attempt);
                warn!(
                    "RPC call at block {} failed ({}), retry {}/{} in {:?}",
                    from_block, err, attempt, max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Syncs one contract to the current head using `provider`.
pub async fn sync_contract(
    provider: &dyn LogProvider,
    storage: &dyn CredentialStorage,
    contract: &ContractConfig,
    config: &SyncConfig,
) -> Result<SyncReport, SyncError> {
    let address: Address = parse_address(&contract.address)
        .map_err(|e| SyncError::InvalidContract(format!("{}: {e}", contract.id)))?;
    let strategy = RetryStrategy::from_config(config);

    let checkpoint = storage.get_checkpoint(&contract.id).await?;
    let start = checkpoint
        .as_ref()
        .map_or(contract.deployed_block, |c| c.last_block.saturating_add(1))
        .max(contract.deployed_block);

    let head = with_retry(&strategy, config.max_retries, start, || provider.block_number()).await?;

    // The ledger is rebuilt from what is already stored so new ranges are
    // checked against the true running balances.
    let mut ledger = BalanceLedger::replay(&contract.id, &storage.events(&contract.id).await?)?;

    let mut report = SyncReport {
        contract_id: contract.id.clone(),
        from_block: start,
        to_block: head,
        events: 0,
        total_supply: ledger.total_supply(),
        whales: ledger.whales().len(),
    };
    if start > head {
        debug!("{} is up to date at block {}", contract.id, head);
        return Ok(report);
    }

    info!(
        "Syncing {} via {} from block {} to {}",
        contract.id,
        provider.name(),
        start,
        head
    );

    let mut sizer = BatchSizer::from_config(config);
    let mut cursor = start;
    while cursor <= head {
        let end = cursor.saturating_add(sizer.current() - 1).min(head);
        let fetched = with_retry(&strategy, config.max_retries, cursor, || {
            provider.transfer_logs(&contract.id, address, cursor, end)
        })
        .await;

        let mut events = match fetched {
            Ok(events) => events,
            Err(SyncError::Rpc(RpcError::ResponseTooLarge { message, .. })) => {
                if !sizer.shrink() {
                    return Err(SyncError::UnsplittableRange { block: cursor });
                }
                debug!(
                    "Range {}..={} too large for {} ({}), shrinking to {}",
                    cursor,
                    end,
                    contract.id,
                    message,
                    sizer.current()
                );
                continue;
            }
            Err(err) => return Err(err),
        };

        events.sort_by_key(|e| e.key());
        events.dedup_by_key(|e| e.key());
        // Events at or before the ledger's position were stored by an earlier
        // run whose checkpoint write did not land.
        events.retain(|e| ledger.last_key().map_or(true, |last| e.key() > last));
        for event in &events {
            ledger.apply(event)?;
        }

        let added = storage.commit_batch(&contract.id, &events, end).await?;
        debug!(
            "{}: blocks {}..={} -> {} events ({} new)",
            contract.id,
            cursor,
            end,
            events.len(),
            added
        );
        report.events += added;
        sizer.record_success();
        cursor = end + 1;
    }

    report.total_supply = ledger.total_supply();
    report.whales = ledger.whales().len();
    info!(
        "Synced {} through block {}: {} new events, {} whales",
        contract.id, head, report.events, report.whales
    );
    Ok(report)
}
