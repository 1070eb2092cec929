//! EVM chains: `eth_call` batches evaluated against a single block.
use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::Bytes;
use alloy_primitives::B256;
use async_trait::async_trait;
use ccq_auth::AuthorizationError;
use ccq_auth::CallFingerprint;
use ccq_messages::ChainId;
use ccq_messages::ChainSpecificQuery;
use ccq_messages::ChainSpecificResponse;
use ccq_messages::EthCallData;
use ccq_messages::EthCallQueryResponse;
use ccq_messages::QueryType;
use tracing::debug;
use tracing::info;

use crate::registry::QueryHandler;
use crate::ExecutionError;

mod alloy_client;

#[cfg(any(test, feature = "dummy-executor"))]
mod dummy_client;

pub use alloy_client::AlloyEvmClient;
#[cfg(any(test, feature = "dummy-executor"))]
pub use dummy_client::DummyEvmClient;

/// `pending` is left out: its block has no hash yet.
const NAMED_BLOCK_TAGS: [&str; 4] = ["latest", "safe", "finalized", "earliest"];

/// The block a batch of calls is pinned to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockContext {
    pub number: u64,
    pub hash: B256,
    pub time_micros: u64,
}

/// Read access to one EVM chain.
#[async_trait]
pub trait EvmClient: Send + Sync {
    /// Resolves `block_tag` (hex number or named tag) to a concrete block.
    async fn block_context(
        &self,
        block_tag: &str,
    ) -> Result<BlockContext, ExecutionError>;

    /// Runs `call` at `block_number`, returning the raw return data.
    async fn call(
        &self,
        call: &EthCallData,
        block_number: u64,
    ) -> Result<Bytes, ExecutionError>;
}

/// Checks that `block_tag` is a `0x` prefixed block number or one of the named tags.
pub fn validate_block_tag(block_tag: &str) -> Result<(), ExecutionError> {
    if NAMED_BLOCK_TAGS.contains(&block_tag) {
        return Ok(());
    }
    match block_tag.strip_prefix("0x") {
        Some(number) if u64::from_str_radix(number, 16).is_ok() => Ok(()),
        _ => Err(ExecutionError::InvalidBlockTag(block_tag.to_owned())),
    }
}

/// Creates the client for `chain_id`.
#[allow(unused_variables)]
pub fn create_client(
    chain_id: ChainId,
    rpc_url: &str,
) -> anyhow::Result<Arc<dyn EvmClient>> {
    #[cfg(feature = "dummy-executor")]
    {
        info!("Creating dummy evm client. chain_id: {}", chain_id);
        Ok(Arc::new(DummyEvmClient::new(chain_id)))
    }

    #[cfg(not(feature = "dummy-executor"))]
    {
        use anyhow::Context;

        let url = rpc_url
            .parse()
            .with_context(|| format!("invalid rpc url for chain {chain_id}"))?;
        info!("Creating evm client. chain_id: {} url: {}", chain_id, rpc_url);
        Ok(Arc::new(AlloyEvmClient::new(chain_id, url)))
    }
}

/// Handler for [`QueryType::EthCall`].
#[derive(Default)]
pub struct EthCallHandler {
    clients: HashMap<ChainId, Arc<dyn EvmClient>>,
}

impl EthCallHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(
        mut self,
        chain_id: ChainId,
        client: Arc<dyn EvmClient>,
    ) -> Self {
        self.insert(chain_id, client);
        self
    }

    pub fn insert(
        &mut self,
        chain_id: ChainId,
        client: Arc<dyn EvmClient>,
    ) {
        self.clients.insert(chain_id, client);
    }

    pub fn chains(&self) -> impl Iterator<Item = ChainId> + '_ {
        self.clients.keys().copied()
    }

    fn client(
        &self,
        chain_id: ChainId,
    ) -> Result<&dyn EvmClient, ExecutionError> {
        self.clients
            .get(&chain_id)
            .map(|client| client.as_ref())
            .ok_or(ExecutionError::UnsupportedChain(chain_id))
    }
}

#[async_trait]
impl QueryHandler for EthCallHandler {
    fn query_type(&self) -> QueryType {
        QueryType::EthCall
    }

    fn fingerprints(
        &self,
        chain_id: ChainId,
        query: &ChainSpecificQuery,
    ) -> Result<Vec<CallFingerprint>, AuthorizationError> {
        let ChainSpecificQuery::EthCall(query) = query;

        query
            .calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                let malformed = |reason| {
                    AuthorizationError::MalformedCall {
                        chain_id,
                        index,
                        reason,
                    }
                };
                let selector = call
                    .selector()
                    .ok_or_else(|| malformed("eth call data must be at least four bytes"))?;
                CallFingerprint::new(QueryType::EthCall, chain_id, call.to.as_slice(), selector)
                    .ok_or_else(|| malformed("call target is too wide"))
            })
            .collect()
    }

    async fn execute(
        &self,
        chain_id: ChainId,
        query: &ChainSpecificQuery,
    ) -> Result<ChainSpecificResponse, ExecutionError> {
        let ChainSpecificQuery::EthCall(query) = query;

        validate_block_tag(&query.block_tag)?;
        let client = self.client(chain_id)?;

        let block = client.block_context(&query.block_tag).await?;
        debug!(
            "Resolved block. chain_id: {} block_tag: {} block_number: {}",
            chain_id, query.block_tag, block.number
        );

        // Sequential, so that every call observes the same pinned block.
        let mut results = Vec::with_capacity(query.calls.len());
        for call in &query.calls {
            results.push(client.call(call, block.number).await?);
        }

        Ok(EthCallQueryResponse {
            block_number: block.number,
            block_hash: block.hash,
            block_time: block.time_micros,
            results,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use alloy_primitives::address;
    use ccq_messages::EthCallQueryRequest;

    use super::*;

    /// Records the block number every call was pinned to.
    struct RecordingClient {
        block: BlockContext,
        pinned: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl EvmClient for RecordingClient {
        async fn block_context(
            &self,
            _block_tag: &str,
        ) -> Result<BlockContext, ExecutionError> {
            Ok(self.block)
        }

        async fn call(
            &self,
            call: &EthCallData,
            block_number: u64,
        ) -> Result<Bytes, ExecutionError> {
            self.pinned.lock().unwrap().push(block_number);
            Ok(call.data.clone())
        }
    }

    fn query(
        block_tag: &str,
        data: Vec<Vec<u8>>,
    ) -> ChainSpecificQuery {
        let to = address!("0d500b1d8e8ef31e21c99d1db9a6444d3adf1270");
        EthCallQueryRequest::new(
            block_tag,
            data.into_iter()
                .map(|data| EthCallData::new(to, data))
                .collect(),
        )
        .into()
    }

    #[test]
    fn short_call_data_is_malformed() {
        let handler = EthCallHandler::new();
        let err = handler
            .fingerprints(2, &query("latest", vec![vec![1, 2, 3, 4], vec![1, 2, 3]]))
            .unwrap_err();
        assert_eq!(
            err,
            AuthorizationError::MalformedCall {
                chain_id: 2,
                index: 1,
                reason: "eth call data must be at least four bytes",
            }
        );
        assert!(err.to_string().contains("eth call data must be at least four bytes"));
    }

    #[test]
    fn block_tags() {
        for tag in ["latest", "finalized", "safe", "0x28d9630", "0x0"] {
            assert_eq!(validate_block_tag(tag), Ok(()), "{tag}");
        }
        for tag in ["", "0x", "28d9630", "0xzz", "Latest", "pending"] {
            assert!(validate_block_tag(tag).is_err(), "{tag}");
        }
    }

    #[tokio::test]
    async fn calls_are_pinned_to_one_block() -> anyhow::Result<()> {
        let client = Arc::new(RecordingClient {
            block: BlockContext {
                number: 42_834_480,
                hash: B256::repeat_byte(0x11),
                time_micros: 1_700_000_000_000_000,
            },
            pinned: Mutex::new(vec![]),
        });
        let handler = EthCallHandler::new().with_client(5, client.clone());

        let response = handler
            .execute(5, &query("latest", vec![vec![1; 4], vec![2; 4], vec![3; 4]]))
            .await?;

        let ChainSpecificResponse::EthCall(response) = response;
        assert_eq!(response.block_number, 42_834_480);
        assert_eq!(response.block_time, 1_700_000_000_000_000);
        assert_eq!(
            response.results,
            vec![
                Bytes::from(vec![1; 4]),
                Bytes::from(vec![2; 4]),
                Bytes::from(vec![3; 4])
            ]
        );
        assert_eq!(*client.pinned.lock().unwrap(), vec![42_834_480; 3]);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_block_tag_is_rejected_before_the_chain() {
        let client = Arc::new(DummyEvmClient::new(5));
        let handler = EthCallHandler::new().with_client(5, client.clone());

        assert_eq!(
            handler
                .execute(5, &query("yesterday", vec![vec![1; 4]]))
                .await,
            Err(ExecutionError::InvalidBlockTag("yesterday".to_string()))
        );
        assert_eq!(client.executed_calls(), 0);
    }
}
