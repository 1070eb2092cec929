use alloy::providers::Provider;
use alloy::providers::RootProvider;
use alloy::transports::TransportError;
use alloy_primitives::Address;
use alloy_primitives::Bytes;
use alloy_primitives::B256;
use alloy_primitives::U64;
use async_trait::async_trait;
use ccq_messages::ChainId;
use ccq_messages::EthCallData;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use url::Url;

use crate::evm::BlockContext;
use crate::evm::EvmClient;
use crate::ExecutionError;

/// The header fields a query response needs.
#[derive(Clone, Debug, Deserialize)]
struct BlockHeader {
    number: U64,
    hash: B256,
    timestamp: U64,
}

#[derive(Clone, Debug, Serialize)]
struct CallRequest {
    to: Address,
    data: Bytes,
}

/// JSON-RPC client for one EVM chain.
#[derive(Clone, Debug)]
pub struct AlloyEvmClient {
    chain_id: ChainId,
    provider: RootProvider,
}

impl AlloyEvmClient {
    pub fn new(
        chain_id: ChainId,
        url: Url,
    ) -> Self {
        Self {
            chain_id,
            provider: RootProvider::new_http(url),
        }
    }

    /// JSON-RPC error replies and undecodable replies are `Rejected`, anything else is `Rpc`.
    fn rpc_error(
        &self,
        err: TransportError,
    ) -> ExecutionError {
        if err.is_error_resp() || err.is_deser_error() {
            ExecutionError::Rejected {
                chain_id: self.chain_id,
                reason: err.to_string(),
            }
        } else {
            ExecutionError::Rpc {
                chain_id: self.chain_id,
                reason: err.to_string(),
            }
        }
    }
}

/// Positional params of `eth_call`: the call object and a hex block number.
fn call_params(
    call: &EthCallData,
    block_number: u64,
) -> (CallRequest, String) {
    (
        CallRequest {
            to: call.to,
            data: call.data.clone(),
        },
        format!("{block_number:#x}"),
    )
}

#[async_trait]
impl EvmClient for AlloyEvmClient {
    async fn block_context(
        &self,
        block_tag: &str,
    ) -> Result<BlockContext, ExecutionError> {
        let header: Option<BlockHeader> = self
            .provider
            .raw_request(
                "eth_getBlockByNumber".into(),
                (block_tag.to_owned(), false),
            )
            .await
            .map_err(|err| self.rpc_error(err))?;

        let header = header.ok_or_else(|| {
            ExecutionError::BlockNotFound {
                chain_id: self.chain_id,
                block_tag: block_tag.to_owned(),
            }
        })?;

        Ok(BlockContext {
            number: header.number.to::<u64>(),
            hash: header.hash,
            time_micros: header.timestamp.to::<u64>().saturating_mul(1_000_000),
        })
    }

    async fn call(
        &self,
        call: &EthCallData,
        block_number: u64,
    ) -> Result<Bytes, ExecutionError> {
        self.provider
            .raw_request("eth_call".into(), call_params(call, block_number))
            .await
            .map_err(|err| self.rpc_error(err))
    }
}
