use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use alloy_primitives::keccak256;
use alloy_primitives::Bytes;
use async_trait::async_trait;
use ccq_messages::ChainId;
use ccq_messages::EthCallData;

use crate::evm::BlockContext;
use crate::evm::EvmClient;
use crate::ExecutionError;

/// Number reported for named block tags.
const HEAD_BLOCK: u64 = 20_000_000;

/// Seconds between two dummy blocks.
const BLOCK_INTERVAL: u64 = 12;

const GENESIS_TIME: u64 = 1_438_269_973;

/// Client that talks to no node. Blocks and results are derived from the
/// inputs, so the same query always gets the same answer.
#[derive(Debug, Default)]
pub struct DummyEvmClient {
    chain_id: ChainId,
    delay: Duration,
    executed_calls: AtomicUsize,
}

impl DummyEvmClient {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            ..Default::default()
        }
    }

    /// Makes every block lookup wait for `delay` first.
    pub fn with_delay(
        mut self,
        delay: Duration,
    ) -> Self {
        self.delay = delay;
        self
    }

    /// How many calls this client has run.
    pub fn executed_calls(&self) -> usize {
        self.executed_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EvmClient for DummyEvmClient {
    async fn block_context(
        &self,
        block_tag: &str,
    ) -> Result<BlockContext, ExecutionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let number = match block_tag.strip_prefix("0x") {
            Some(number) => u64::from_str_radix(number, 16)
                .map_err(|_| ExecutionError::InvalidBlockTag(block_tag.to_owned()))?,
            None => HEAD_BLOCK,
        };

        let mut preimage = self.chain_id.to_be_bytes().to_vec();
        preimage.extend_from_slice(&number.to_be_bytes());

        Ok(BlockContext {
            number,
            hash: keccak256(&preimage),
            time_micros: number
                .saturating_mul(BLOCK_INTERVAL)
                .saturating_add(GENESIS_TIME)
                .saturating_mul(1_000_000),
        })
    }

    async fn call(
        &self,
        call: &EthCallData,
        block_number: u64,
    ) -> Result<Bytes, ExecutionError> {
        self.executed_calls.fetch_add(1, Ordering::Relaxed);

        let mut preimage = call.to.to_vec();
        preimage.extend_from_slice(&call.data);
        preimage.extend_from_slice(&block_number.to_be_bytes());
        Ok(Bytes::copy_from_slice(keccak256(&preimage).as_slice()))
    }
}
