use alloy_primitives::Address;
use alloy_primitives::Bytes;
use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use ccq_auth::query_response_digest;
use ccq_auth::signature::recover_signer;
use ccq_auth::Environment;
use ccq_auth::QuerySigner;
use ccq_gateway::server::QueryRequestBody;
use ccq_gateway::server::QueryResponseBody;
use ccq_gateway::server::API_KEY_HEADER;
use ccq_messages::ChainId;
use ccq_messages::ChainSpecificResponse;
use ccq_messages::EthCallData;
use ccq_messages::EthCallQueryRequest;
use ccq_messages::PerChainQueryRequest;
use ccq_messages::QueryRequest;
use ccq_messages::QueryResponse;
use clap::Parser;
use tracing::debug;
use tracing::info;
use tracing_subscriber::EnvFilter;

const API_KEY_ENV_VAR: &str = "CCQ_API_KEY";
const PRIVATE_KEY_ENV_VAR: &str = "CCQ_PRIVATE_KEY";

/// Sends one eth_call query to a gateway and prints the verified answer.
#[derive(Parser, Debug)]
struct Cli {
    /// Base URL of the gateway.
    #[clap(long, default_value = "http://localhost:8080")]
    gateway_url: String,

    #[clap(long, env = API_KEY_ENV_VAR)]
    api_key: String,

    /// Hex private key signing the request. Unsigned requests need a gateway in optional mode.
    #[clap(long, env = PRIVATE_KEY_ENV_VAR)]
    private_key: Option<String>,

    #[clap(long, default_value = "mainnet")]
    environment: Environment,

    #[clap(long)]
    chain_id: ChainId,

    /// Hex block number or `latest`, `safe`, `finalized`.
    #[clap(long, default_value = "latest")]
    block_tag: String,

    /// A call as `<address>:<hex call data>`. May be repeated.
    #[clap(long = "call", required = true, value_parser = parse_call)]
    calls: Vec<EthCallData>,

    /// Request nonce, random when unset.
    #[clap(long)]
    nonce: Option<u32>,
}

fn parse_call(s: &str) -> Result<EthCallData> {
    let Some((to, data)) = s.split_once(':') else {
        bail!("expected `<address>:<hex call data>`, got `{s}`");
    };
    let to: Address = to.parse().context("parsing call target")?;
    let data = hex::decode(data.strip_prefix("0x").unwrap_or(data)).context("parsing call data")?;
    Ok(EthCallData::new(to, data))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    debug!("Running client. gateway_url: {}", cli.gateway_url);

    let request = QueryRequest::new(
        cli.nonce.unwrap_or_else(rand::random),
        vec![PerChainQueryRequest::new(
            cli.chain_id,
            EthCallQueryRequest::new(cli.block_tag.clone(), cli.calls.clone()),
        )],
    );
    let request_bytes = request.serialize().context("encoding query request")?;

    let signature = match &cli.private_key {
        Some(private_key) => {
            let signer = QuerySigner::from_hex(private_key)
                .context("parsing private key")?;
            info!("Signing request. signer: {}", signer.address());
            hex::encode(signer.sign_request(cli.environment, &request_bytes)?)
        },
        None => String::new(),
    };

    let body = QueryRequestBody {
        signature,
        bytes: hex::encode(&request_bytes),
    };

    let url = format!("{}/v1/query", cli.gateway_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .put(&url)
        .header(API_KEY_HEADER, &cli.api_key)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("sending query to {url}"))?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        bail!("gateway rejected the query. status: {} err: {}", status, message.trim_end());
    }

    let body: QueryResponseBody = response.json().await.context("reading gateway reply")?;
    let response_bytes = hex::decode(&body.bytes).context("decoding response hex")?;
    let response = QueryResponse::deserialize(&response_bytes).context("decoding query response")?;

    ensure!(
        response.request_bytes == Bytes::from(request_bytes),
        "gateway answered a different request"
    );

    match &body.signature {
        Some(signature) => {
            let signature = hex::decode(signature).context("decoding response signature")?;
            let signer = recover_signer(&query_response_digest(&response_bytes), &signature)?;
            println!("response signed by {signer}");
        },
        None => println!("response is not signed"),
    }

    for per_chain in &response.per_chain_responses {
        let ChainSpecificResponse::EthCall(eth_call) = &per_chain.response;
        println!(
            "chain {} block {} ({}) time {}",
            per_chain.chain_id, eth_call.block_number, eth_call.block_hash, eth_call.block_time
        );
        for (call, result) in cli.calls.iter().zip(&eth_call.results) {
            println!("  {} {} -> {}", call.to, call.data, result);
        }
    }

    Ok(())
}
