//! Per query type behaviour: how a query is reduced to call fingerprints and
//! how it is executed against a chain.
use std::time::Duration;

use ccq_messages::ChainId;
use ccq_messages::QueryType;
use thiserror::Error;

pub mod evm;
pub mod registry;

pub use registry::HandlerRegistry;
pub use registry::QueryHandler;
pub use registry::RegistryError;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("no handler registered for query type {0}")]
    UnsupportedQueryType(QueryType),

    #[error("chain {0} is not supported by this gateway")]
    UnsupportedChain(ChainId),

    #[error("invalid block tag `{0}`")]
    InvalidBlockTag(String),

    #[error("block `{block_tag}` not found on chain {chain_id}")]
    BlockNotFound { chain_id: ChainId, block_tag: String },

    #[error("rpc request to chain {chain_id} failed: {reason}")]
    Rpc { chain_id: ChainId, reason: String },

    /// The node answered, but with an error or a reply that cannot be used. Retrying gets the same answer.
    #[error("chain {chain_id} rejected the request: {reason}")]
    Rejected { chain_id: ChainId, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("per chain query {index} on chain {chain_id} failed: {source}")]
    PerChain {
        index: usize,
        chain_id: ChainId,
        #[source]
        source: Box<ExecutionError>,
    },
}

impl ExecutionError {
    /// Wraps an error with the position of the per-chain query that produced it.
    pub fn in_per_chain_query(
        self,
        index: usize,
        chain_id: ChainId,
    ) -> Self {
        ExecutionError::PerChain {
            index,
            chain_id,
            source: Box::new(self),
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutionError::Rpc { .. } | ExecutionError::Timeout(_) => true,
            ExecutionError::PerChain { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            ExecutionError::Timeout(_) => true,
            ExecutionError::PerChain { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Errors caused by what the caller asked for, rather than by the gateway or a chain.
    pub fn is_client_error(&self) -> bool {
        match self {
            ExecutionError::InvalidBlockTag(_) | ExecutionError::UnsupportedChain(_) => true,
            ExecutionError::PerChain { source, .. } => source.is_client_error(),
            _ => false,
        }
    }
}
