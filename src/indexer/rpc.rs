//! `Transfer` log provider over an Ethereum JSON-RPC endpoint.

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::{Address, Filter, Log, H256, U256};
use ethers::utils::keccak256;

use crate::error::RpcError;
use crate::types::TransferEvent;

/// Event signature of ERC-20 `Transfer`.
pub const TRANSFER_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// topic0 of every ERC-20 `Transfer` log.
pub fn transfer_topic() -> H256 {
    H256::from(keccak256(TRANSFER_SIGNATURE))
}

/// Source of chain heads and `Transfer` logs for one chain.
#[async_trait]
pub trait LogProvider: Send + Sync {
    /// Human readable endpoint name for logs.
    fn name(&self) -> &str;

    async fn block_number(&self) -> Result<u64, RpcError>;

    /// All `Transfer` logs of `address` in `from_block..=to_block`.
    async fn transfer_logs(
        &self,
        contract_id: &str,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, RpcError>;
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "too many requests",
    "rate limit",
    "request rate exceeded",
    "request count limit",
    "capacity exceeded",
];

const TOO_LARGE_MARKERS: &[&str] = &[
    "response too large",
    "response size exceeded",
    "query returned more than",
    "log response size",
    "block range too large",
    "block range is too wide",
    "exceed maximum block range",
    "block range limit exceeded",
    "log limit exceeded",
    "too many results",
];

const FATAL_MARKERS: &[&str] = &["invalid params", "method not found", "unknown block"];

/// Maps a provider error message onto the retry classes.
pub fn classify_error(message: &str, from: u64, to: u64) -> RpcError {
    let lower = message.to_ascii_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        RpcError::Transient(message.to_string())
    } else if TOO_LARGE_MARKERS.iter().any(|m| lower.contains(m)) {
        RpcError::ResponseTooLarge {
            from,
            to,
            message: message.to_string(),
        }
    } else if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
        RpcError::Fatal(message.to_string())
    } else {
        RpcError::Transient(message.to_string())
    }
}

fn provider_error(err: ProviderError, from: u64, to: u64) -> RpcError {
    match err {
        ProviderError::SerdeJson(e) => RpcError::Fatal(format!("undecodable response: {e}")),
        other => classify_error(&other.to_string(), from, to),
    }
}

/// Decodes one ERC-20 `Transfer` log.
///
/// Logs whose shape is not `Transfer(address indexed, address indexed,
/// uint256)` (for example ERC-721 transfers) are rejected as fatal: the
/// tracked contract is misconfigured.
pub fn parse_transfer_log(contract_id: &str, log: &Log) -> Result<TransferEvent, RpcError> {
    if log.topics.len() != 3 || log.topics[0] != transfer_topic() {
        return Err(RpcError::Fatal(format!(
            "log {:?} in tx {:?} is not an ERC-20 Transfer",
            log.log_index, log.transaction_hash
        )));
    }
    if log.data.len() != 32 {
        return Err(RpcError::Fatal(format!(
            "Transfer value must be 32 bytes, got {}",
            log.data.len()
        )));
    }

    let missing = |field: &str| RpcError::Fatal(format!("log is missing {field}"));
    let block_number = log.block_number.ok_or_else(|| missing("block_number"))?;
    let tx_index = log.transaction_index.ok_or_else(|| missing("transaction_index"))?;
    let log_index = log.log_index.ok_or_else(|| missing("log_index"))?;

    Ok(TransferEvent {
        contract_id: contract_id.to_string(),
        from: Address::from(log.topics[1]),
        to: Address::from(log.topics[2]),
        value: U256::from_big_endian(&log.data),
        block_number: block_number.as_u64(),
        tx_index: tx_index.as_u64(),
        log_index: log_index.low_u64(),
    })
}

/// [`LogProvider`] backed by an ethers HTTP provider.
#[derive(Debug, Clone)]
pub struct EthersLogProvider {
    name: String,
    provider: Provider<Http>,
}

impl EthersLogProvider {
    pub fn new(name: impl Into<String>, url: &str) -> Result<Self, RpcError> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| RpcError::Fatal(format!("invalid RPC url: {e}")))?;
        Ok(Self {
            name: name.into(),
            provider,
        })
    }
}

#[async_trait]
impl LogProvider for EthersLogProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| provider_error(e, 0, 0))
    }

    async fn transfer_logs(
        &self,
        contract_id: &str,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, RpcError> {
        let filter = Filter::new()
            .address(address)
            .topic0(transfer_topic())
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| provider_error(e, from_block, to_block))?;

        logs.iter()
            .filter(|log| log.removed != Some(true))
            .map(|log| parse_transfer_log(contract_id, log))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, U64};

    fn topic(address: Address) -> H256 {
        H256::from(address)
    }

    fn transfer_log(from: Address, to: Address, value: u64) -> Log {
        let mut data = [0u8; 32];
        U256::from(value).to_big_endian(&mut data);
        Log {
            topics: vec![transfer_topic(), topic(from), topic(to)],
            data: Bytes::from(data.to_vec()),
            block_number: Some(U64::from(105)),
            transaction_index: Some(U64::from(3)),
            log_index: Some(U256::from(7)),
            ..Default::default()
        }
    }

    #[test]
    fn test_transfer_topic_matches_known_hash() {
        assert_eq!(
            hex::encode(transfer_topic()),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_parse_transfer_log() {
        let from = Address::repeat_byte(0xAA);
        let to = Address::repeat_byte(0xBB);
        let event = parse_transfer_log("token", &transfer_log(from, to, 2_000)).unwrap();
        assert_eq!(event.from, from);
        assert_eq!(event.to, to);
        assert_eq!(event.value, U256::from(2_000));
        assert_eq!((event.block_number, event.tx_index, event.log_index), (105, 3, 7));
    }

    #[test]
    fn test_rejects_non_erc20_logs() {
        let mut log = transfer_log(Address::zero(), Address::repeat_byte(1), 1);
        log.topics.push(H256::zero());
        assert!(matches!(
            parse_transfer_log("token", &log),
            Err(RpcError::Fatal(_))
        ));

        let mut log = transfer_log(Address::zero(), Address::repeat_byte(1), 1);
        log.block_number = None;
        assert!(parse_transfer_log("token", &log).is_err());
    }

    #[test]
    fn test_classify_error() {
        assert!(matches!(
            classify_error("query returned more than 10000 results", 1, 9),
            RpcError::ResponseTooLarge { from: 1, to: 9, .. }
        ));
        assert!(matches!(
            classify_error("Log response size exceeded", 1, 9),
            RpcError::ResponseTooLarge { .. }
        ));
        assert!(matches!(
            classify_error("block range limit exceeded", 1, 9),
            RpcError::ResponseTooLarge { .. }
        ));
        assert!(classify_error("connection reset by peer", 1, 9).is_retryable());
        assert!(!classify_error("Invalid params", 1, 9).is_retryable());
    }

    #[test]
    fn test_rate_limits_back_off_instead_of_splitting() {
        for message in [
            "rate limit exceeded",
            "429 Too Many Requests: rate limit exceeded",
            "project ID request rate exceeded",
            "daily request count limit exceeded",
        ] {
            let err = classify_error(message, 1, 9);
            assert!(err.is_retryable(), "{message}");
            assert!(!matches!(err, RpcError::ResponseTooLarge { .. }), "{message}");
        }
    }
}
