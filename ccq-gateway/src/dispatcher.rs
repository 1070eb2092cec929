use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use alloy_primitives::Address;
use anyhow::Context;
use ccq_auth::authenticate;
use ccq_auth::query_request_digest;
use ccq_auth::signature::recover_signer;
use ccq_auth::ApiKeyStore;
use ccq_auth::Environment;
use ccq_auth::Permissions;
use ccq_auth::QuerySigner;
use ccq_auth::SignatureError;
use ccq_executors::evm::create_client;
use ccq_executors::evm::EthCallHandler;
use ccq_executors::ExecutionError;
use ccq_executors::HandlerRegistry;
use ccq_messages::ChainSpecificResponse;
use ccq_messages::PerChainQueryRequest;
use ccq_messages::QueryRequest;
use ccq_messages::QueryResponse;
use ccq_messages::RawSignature;
use ccq_messages::SignedQueryRequest;
use derive_debug_plus::Dbg;
use futures::future::try_join_all;
use serde_derive::Deserialize;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::error::GatewayError;
use crate::metrics::Metrics;

/// Pause between two attempts of the same per-chain query.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Whether callers must sign their requests.
///
/// The api key always decides admission; the signature attributes the request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureMode {
    /// Unsigned requests are rejected.
    #[default]
    Required,

    /// Unsigned requests are signed by the gateway's own key.
    Optional,
}

#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub environment: Environment,
    pub signature_mode: SignatureMode,

    /// Bound on one attempt of one per-chain query.
    pub query_timeout: Duration,

    /// Bound on the execution of a whole request, retries included.
    pub request_timeout: Duration,

    /// Extra attempts for a per-chain query failing with a transient error.
    pub max_retries: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            signature_mode: SignatureMode::default(),
            query_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
        }
    }
}

/// An answered query.
#[derive(Clone, Dbg)]
pub struct DispatchOutcome {
    /// Serialized [`QueryResponse`].
    #[dbg(formatter = ccq_messages::hex_pretty)]
    pub response_bytes: Vec<u8>,

    /// The gateway's signature over the response digest, when it has a key.
    pub response_signature: Option<RawSignature>,

    /// Address the request is attributed to.
    pub signer: Address,
}

/// Runs signed queries end to end: decode, verify, authorize, execute, encode.
pub struct QueryDispatcher {
    settings: DispatcherSettings,
    api_keys: Arc<dyn ApiKeyStore>,
    registry: HandlerRegistry,
    signer: Option<QuerySigner>,
    metrics: Metrics,
}

impl QueryDispatcher {
    pub fn new(
        settings: DispatcherSettings,
        api_keys: Arc<dyn ApiKeyStore>,
        registry: HandlerRegistry,
        signer: Option<QuerySigner>,
    ) -> Self {
        Self {
            settings,
            api_keys,
            registry,
            signer,
            metrics: Metrics::new(),
        }
    }

    /// Builds a dispatcher with a handler for every query type the chains in `config` serve.
    pub fn from_config(
        config: &Config,
        api_keys: Arc<dyn ApiKeyStore>,
    ) -> anyhow::Result<Self> {
        info!("Registering the query handlers");

        let mut eth_call = EthCallHandler::new();
        for chain in &config.chains {
            let client = create_client(chain.chain_id, &chain.rpc_url)
                .with_context(|| format!("creating client for chain {}", chain.chain_id))?;
            eth_call.insert(chain.chain_id, client);
        }

        let mut registry = HandlerRegistry::new();
        registry.register(eth_call);

        let signer = config.gateway.signer()?;
        if let Some(signer) = &signer {
            info!("Gateway signer loaded. address: {}", signer.address());
        }

        info!("Finished registering the query handlers.");

        Ok(Self::new(
            config.gateway.settings(),
            api_keys,
            registry,
            signer,
        ))
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn authenticate(
        &self,
        api_key: Option<&str>,
    ) -> Result<Arc<Permissions>, GatewayError> {
        Ok(authenticate(self.api_keys.as_ref(), api_key)?)
    }

    /// Authenticates `api_key`, then dispatches `signed` under its permissions.
    pub async fn handle(
        &self,
        api_key: Option<&str>,
        signed: SignedQueryRequest,
    ) -> Result<DispatchOutcome, GatewayError> {
        let permissions = self.authenticate(api_key)?;
        self.dispatch(&permissions, signed).await
    }

    /// Answers a request of an already authenticated caller.
    ///
    /// Every call is authorized before any call is executed.
    #[tracing::instrument(skip_all, fields(user = permissions.user_name()), err(Display))]
    pub async fn dispatch(
        &self,
        permissions: &Permissions,
        signed: SignedQueryRequest,
    ) -> Result<DispatchOutcome, GatewayError> {
        let request = QueryRequest::deserialize(&signed.request_bytes)?;

        let (signature, signer) = self.verify_signature(&signed)?;
        permissions.authorize_signer(signer)?;

        let fingerprints = self.registry.fingerprints(&request)?;
        permissions.authorize_all(&fingerprints)?;

        info!(
            "Dispatching query. signer: {} nonce: {} per_chain_queries: {} calls: {}",
            signer,
            request.nonce,
            request.per_chain_queries.len(),
            fingerprints.len(),
        );

        let request_timeout = self.settings.request_timeout;
        let responses = timeout(request_timeout, self.execute_all(&request))
            .await
            .map_err(|_| ExecutionError::Timeout(request_timeout))??;

        let response = QueryResponse::new(signature, signed.request_bytes, request, responses)?;
        let response_bytes = response.serialize()?;

        let response_signature = self
            .signer
            .as_ref()
            .map(|gateway| gateway.sign_response(&response_bytes))
            .transpose()
            .map_err(GatewayError::Signing)?;

        Ok(DispatchOutcome {
            response_bytes,
            response_signature,
            signer,
        })
    }

    /// Returns the signature the response carries and the address it recovers to.
    fn verify_signature(
        &self,
        signed: &SignedQueryRequest,
    ) -> Result<(RawSignature, Address), GatewayError> {
        let environment = self.settings.environment;

        match (&signed.signature, self.settings.signature_mode, &self.signer) {
            (Some(signature), ..) => {
                let digest = query_request_digest(environment, &signed.request_bytes);
                let signer =
                    recover_signer(&digest, signature).map_err(GatewayError::InvalidSignature)?;
                let signature = RawSignature::try_from(&signature[..]).map_err(|_| {
                    GatewayError::InvalidSignature(SignatureError::InvalidLength(signature.len()))
                })?;
                Ok((signature, signer))
            },
            (None, SignatureMode::Optional, Some(gateway)) => {
                debug!("Signing unsigned request. gateway: {}", gateway.address());
                let signature = gateway
                    .sign_request(environment, &signed.request_bytes)
                    .map_err(GatewayError::Signing)?;
                Ok((signature, gateway.address()))
            },
            (None, ..) => Err(GatewayError::MissingSignature),
        }
    }

    /// Runs every per-chain query concurrently. Responses keep request order; the
    /// first failure cancels the queries still running.
    async fn execute_all(
        &self,
        request: &QueryRequest,
    ) -> Result<Vec<ChainSpecificResponse>, ExecutionError> {
        try_join_all(
            request
                .per_chain_queries
                .iter()
                .enumerate()
                .map(|(index, per_chain)| self.execute_with_retry(index, per_chain)),
        )
        .await
    }

    async fn execute_with_retry(
        &self,
        index: usize,
        per_chain: &PerChainQueryRequest,
    ) -> Result<ChainSpecificResponse, ExecutionError> {
        let chain_id = per_chain.chain_id;
        let query_type = per_chain.query.query_type();
        let query_timeout = self.settings.query_timeout;
        let start_time = Instant::now();

        let mut attempt = 0;
        loop {
            let result = timeout(
                query_timeout,
                self.registry.execute(chain_id, &per_chain.query),
            )
            .await
            .unwrap_or(Err(ExecutionError::Timeout(query_timeout)));

            match result {
                Ok(response) => {
                    self.metrics
                        .observe_query_duration(query_type, start_time.elapsed().as_secs_f64());
                    return Ok(response);
                },
                Err(err) if err.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    warn!(
                        "Retrying per chain query. index: {} chain_id: {} attempt: {} err: {}",
                        index, chain_id, attempt, err,
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                },
                Err(err) => {
                    self.metrics.increment_chain_errors(chain_id);
                    return Err(err.in_per_chain_query(index, chain_id));
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use alloy_primitives::address;
    use alloy_primitives::Bytes;
    use async_trait::async_trait;
    use ccq_auth::query_response_digest;
    use ccq_auth::AuthorizationError;
    use ccq_auth::PolicySet;
    use ccq_executors::evm::BlockContext;
    use ccq_executors::evm::DummyEvmClient;
    use ccq_executors::evm::EvmClient;
    use ccq_messages::EthCallData;
    use ccq_messages::EthCallQueryRequest;
    use k256::ecdsa::SigningKey;

    use super::*;

    const API_KEY: &str = "my_secret_key";
    const WETH: Address = address!("ddb64fe46a91d46ee29420539fc25fd07c5fea3e");
    const NAME: [u8; 4] = [0x06, 0xfd, 0xde, 0x03];
    const TOTAL_SUPPLY: [u8; 4] = [0x18, 0x16, 0x0d, 0xdd];

    /// Fails the first `failures` block lookups with a transient error.
    struct FlakyClient {
        failures: usize,
        attempts: AtomicUsize,
        inner: DummyEvmClient,
    }

    #[async_trait]
    impl EvmClient for FlakyClient {
        async fn block_context(
            &self,
            block_tag: &str,
        ) -> Result<BlockContext, ExecutionError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(ExecutionError::Rpc {
                    chain_id: 2,
                    reason: "connection reset".to_string(),
                });
            }
            self.inner.block_context(block_tag).await
        }

        async fn call(
            &self,
            call: &EthCallData,
            block_number: u64,
        ) -> Result<Bytes, ExecutionError> {
            self.inner.call(call, block_number).await
        }
    }

    /// Every call reverts.
    struct RejectingClient {
        attempts: AtomicUsize,
        inner: DummyEvmClient,
    }

    #[async_trait]
    impl EvmClient for RejectingClient {
        async fn block_context(
            &self,
            block_tag: &str,
        ) -> Result<BlockContext, ExecutionError> {
            self.inner.block_context(block_tag).await
        }

        async fn call(
            &self,
            _call: &EthCallData,
            _block_number: u64,
        ) -> Result<Bytes, ExecutionError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ExecutionError::Rejected {
                chain_id: 2,
                reason: "execution reverted".to_string(),
            })
        }
    }

    fn policy(allowed_calls: &[&str]) -> Arc<PolicySet> {
        let mut policy = PolicySet::new();
        policy
            .insert(
                API_KEY,
                Permissions::parse("Test User", allowed_calls, None).unwrap(),
            )
            .unwrap();
        Arc::new(policy)
    }

    fn dispatcher_with(
        settings: DispatcherSettings,
        client: Arc<dyn EvmClient>,
        signer: Option<QuerySigner>,
    ) -> QueryDispatcher {
        let mut registry = HandlerRegistry::new();
        registry.register(EthCallHandler::new().with_client(2, client));
        QueryDispatcher::new(
            settings,
            policy(&["ethCall:2:0xDDb64fE46a91D46ee29420539FC25FD07c5FEa3E:06fdde03"]),
            registry,
            signer,
        )
    }

    fn signed_request(
        client_key: &QuerySigner,
        selectors: &[[u8; 4]],
    ) -> SignedQueryRequest {
        let calls = selectors
            .iter()
            .map(|selector| EthCallData::new(WETH, selector.to_vec()))
            .collect();
        let request = QueryRequest::new(
            1,
            vec![PerChainQueryRequest::new(
                2,
                EthCallQueryRequest::new("latest", calls),
            )],
        );
        let bytes = request.serialize().unwrap();
        let signature = client_key
            .sign_request(Environment::Mainnet, &bytes)
            .unwrap();
        SignedQueryRequest::new(bytes, Some(Bytes::from(signature.to_vec())))
    }

    fn random_signer() -> QuerySigner {
        QuerySigner::new(SigningKey::random(&mut rand::thread_rng()))
    }

    #[tokio::test]
    async fn answers_an_authorized_request() -> anyhow::Result<()> {
        let client_key = random_signer();
        let gateway_key = random_signer();
        let dispatcher = dispatcher_with(
            DispatcherSettings::default(),
            Arc::new(DummyEvmClient::new(2)),
            Some(gateway_key.clone()),
        );

        let signed = signed_request(&client_key, &[NAME]);
        let outcome = dispatcher.handle(Some(API_KEY), signed.clone()).await?;
        assert_eq!(outcome.signer, client_key.address());

        let response = QueryResponse::deserialize(&outcome.response_bytes)?;
        assert_eq!(response.request_bytes, signed.request_bytes);
        assert_eq!(
            Some(Bytes::copy_from_slice(&response.signature)),
            signed.signature
        );
        assert_eq!(response.per_chain_responses.len(), 1);

        let response_signature = outcome.response_signature.unwrap();
        assert_eq!(
            recover_signer(
                &query_response_digest(&outcome.response_bytes),
                &response_signature
            )?,
            gateway_key.address()
        );
        Ok(())
    }

    #[tokio::test]
    async fn denied_call_executes_nothing() -> anyhow::Result<()> {
        let client = Arc::new(DummyEvmClient::new(2));
        let dispatcher = dispatcher_with(DispatcherSettings::default(), client.clone(), None);

        let signed = signed_request(&random_signer(), &[NAME, TOTAL_SUPPLY]);
        let err = dispatcher.handle(Some(API_KEY), signed).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "call \"ethCall:2:000000000000000000000000ddb64fe46a91d46ee29420539fc25fd07c5fea3e:18160ddd\" not authorized"
        );
        assert!(matches!(
            err,
            GatewayError::Authorization(AuthorizationError::CallNotAuthorized(_))
        ));
        assert_eq!(client.executed_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn denial_on_one_chain_executes_no_chain() -> anyhow::Result<()> {
        let chain_2 = Arc::new(DummyEvmClient::new(2));
        let chain_5 = Arc::new(DummyEvmClient::new(5));
        let mut registry = HandlerRegistry::new();
        registry.register(
            EthCallHandler::new()
                .with_client(2, chain_2.clone())
                .with_client(5, chain_5.clone()),
        );
        let dispatcher = QueryDispatcher::new(
            DispatcherSettings::default(),
            policy(&[
                "ethCall:2:0xDDb64fE46a91D46ee29420539FC25FD07c5FEa3E:06fdde03",
                "ethCall:5:*:*",
            ]),
            registry,
            None,
        );

        let call = |selector: [u8; 4]| EthCallData::new(WETH, selector.to_vec());
        let request = QueryRequest::new(
            1,
            vec![
                PerChainQueryRequest::new(
                    5,
                    EthCallQueryRequest::new("latest", vec![call(NAME), call(TOTAL_SUPPLY)]),
                ),
                PerChainQueryRequest::new(
                    2,
                    EthCallQueryRequest::new("latest", vec![call(NAME), call(TOTAL_SUPPLY)]),
                ),
            ],
        );
        let bytes = request.serialize()?;
        let signature = random_signer().sign_request(Environment::Mainnet, &bytes)?;
        let signed = SignedQueryRequest::new(bytes, Some(Bytes::from(signature.to_vec())));

        let err = dispatcher.handle(Some(API_KEY), signed).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "call \"ethCall:2:000000000000000000000000ddb64fe46a91d46ee29420539fc25fd07c5fea3e:18160ddd\" not authorized"
        );
        assert_eq!(chain_5.executed_calls(), 0);
        assert_eq!(chain_2.executed_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_calls_fail_without_retry() -> anyhow::Result<()> {
        let rejecting = Arc::new(RejectingClient {
            attempts: AtomicUsize::new(0),
            inner: DummyEvmClient::new(2),
        });
        let dispatcher = dispatcher_with(DispatcherSettings::default(), rejecting.clone(), None);

        let err = dispatcher
            .handle(Some(API_KEY), signed_request(&random_signer(), &[NAME]))
            .await
            .unwrap_err();
        assert_eq!(rejecting.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(err.status(), warp::http::StatusCode::INTERNAL_SERVER_ERROR);
        Ok(())
    }

    #[tokio::test]
    async fn signature_modes() -> anyhow::Result<()> {
        let gateway_key = random_signer();
        let mut unsigned = signed_request(&random_signer(), &[NAME]);
        unsigned.signature = None;

        let required = dispatcher_with(
            DispatcherSettings::default(),
            Arc::new(DummyEvmClient::new(2)),
            Some(gateway_key.clone()),
        );
        let err = required
            .handle(Some(API_KEY), unsigned.clone())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "request signature is missing");

        let optional = dispatcher_with(
            DispatcherSettings {
                signature_mode: SignatureMode::Optional,
                ..Default::default()
            },
            Arc::new(DummyEvmClient::new(2)),
            Some(gateway_key.clone()),
        );
        let outcome = optional.handle(Some(API_KEY), unsigned.clone()).await?;
        assert_eq!(outcome.signer, gateway_key.address());

        // A signature that is present must still be valid.
        let mut bad = unsigned;
        bad.signature = Some(Bytes::from(vec![0u8; 10]));
        let err = optional.handle(Some(API_KEY), bad).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidSignature(_)));
        assert!(err.to_string().starts_with("invalid request signature: "));
        Ok(())
    }

    #[tokio::test]
    async fn signature_from_another_environment_is_attributed_elsewhere() -> anyhow::Result<()> {
        let client_key = random_signer();
        let dispatcher = dispatcher_with(
            DispatcherSettings {
                environment: Environment::Testnet,
                ..Default::default()
            },
            Arc::new(DummyEvmClient::new(2)),
            None,
        );

        // Signed for mainnet: recovery succeeds but yields a different address.
        let outcome = dispatcher
            .handle(Some(API_KEY), signed_request(&client_key, &[NAME]))
            .await?;
        assert_ne!(outcome.signer, client_key.address());
        Ok(())
    }

    #[tokio::test]
    async fn transient_errors_are_retried() -> anyhow::Result<()> {
        let settings = DispatcherSettings {
            max_retries: 2,
            ..Default::default()
        };
        let flaky = Arc::new(FlakyClient {
            failures: 2,
            attempts: AtomicUsize::new(0),
            inner: DummyEvmClient::new(2),
        });
        let dispatcher = dispatcher_with(settings.clone(), flaky.clone(), None);
        dispatcher
            .handle(Some(API_KEY), signed_request(&random_signer(), &[NAME]))
            .await?;
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);

        let flaky = Arc::new(FlakyClient {
            failures: 3,
            attempts: AtomicUsize::new(0),
            inner: DummyEvmClient::new(2),
        });
        let dispatcher = dispatcher_with(settings, flaky, None);
        let err = dispatcher
            .handle(Some(API_KEY), signed_request(&random_signer(), &[NAME]))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "per chain query 0 on chain 2 failed: rpc request to chain 2 failed: connection reset"
        );
        Ok(())
    }

    #[tokio::test]
    async fn slow_chains_time_out() -> anyhow::Result<()> {
        let settings = DispatcherSettings {
            query_timeout: Duration::from_millis(20),
            request_timeout: Duration::from_millis(500),
            max_retries: 0,
            ..Default::default()
        };
        let slow = DummyEvmClient::new(2).with_delay(Duration::from_millis(200));
        let dispatcher = dispatcher_with(settings, Arc::new(slow), None);

        let err = dispatcher
            .handle(Some(API_KEY), signed_request(&random_signer(), &[NAME]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), warp::http::StatusCode::GATEWAY_TIMEOUT);
        assert!(err.to_string().contains("chain 2"));
        Ok(())
    }
}
