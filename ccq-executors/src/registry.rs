use std::collections::HashMap;

use async_trait::async_trait;
use ccq_auth::AuthorizationError;
use ccq_auth::CallFingerprint;
use ccq_messages::ChainId;
use ccq_messages::ChainSpecificQuery;
use ccq_messages::ChainSpecificResponse;
use ccq_messages::QueryRequest;
use ccq_messages::QueryType;
use thiserror::Error;
use tracing::info;

use crate::ExecutionError;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Behaviour of one query type, the counterpart of a [`ChainSpecificQuery`] variant.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    fn query_type(&self) -> QueryType;

    /// One fingerprint per atomic call of `query`, in call order.
    fn fingerprints(
        &self,
        chain_id: ChainId,
        query: &ChainSpecificQuery,
    ) -> Result<Vec<CallFingerprint>, AuthorizationError>;

    /// Runs `query` against `chain_id`.
    async fn execute(
        &self,
        chain_id: ChainId,
        query: &ChainSpecificQuery,
    ) -> Result<ChainSpecificResponse, ExecutionError>;
}

/// Handlers keyed by the query type they serve.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<QueryType, Box<dyn QueryHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`, replacing any handler previously registered for its type.
    pub fn register(
        &mut self,
        handler: impl QueryHandler + 'static,
    ) {
        let query_type = handler.query_type();
        info!("Registering query handler. query_type: {}", query_type);
        self.handlers.insert(query_type, Box::new(handler));
    }

    pub fn handler(
        &self,
        query_type: QueryType,
    ) -> Result<&dyn QueryHandler, ExecutionError> {
        self.handlers
            .get(&query_type)
            .map(|handler| handler.as_ref())
            .ok_or(ExecutionError::UnsupportedQueryType(query_type))
    }

    /// Fingerprints of every call in `request`, flattened in request order.
    pub fn fingerprints(
        &self,
        request: &QueryRequest,
    ) -> Result<Vec<CallFingerprint>, RegistryError> {
        let mut fingerprints = Vec::with_capacity(request.call_count());
        for per_chain in &request.per_chain_queries {
            let handler = self.handler(per_chain.query.query_type())?;
            fingerprints.extend(handler.fingerprints(per_chain.chain_id, &per_chain.query)?);
        }
        Ok(fingerprints)
    }

    pub async fn execute(
        &self,
        chain_id: ChainId,
        query: &ChainSpecificQuery,
    ) -> Result<ChainSpecificResponse, ExecutionError> {
        self.handler(query.query_type())?
            .execute(chain_id, query)
            .await
    }
}
