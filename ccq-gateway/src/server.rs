//! HTTP transport: `PUT /v1/query` and the health check.
use std::convert::Infallible;
use std::sync::Arc;

use ccq_messages::SignedQueryRequest;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use tracing::info;
use tracing::info_span;
use tracing::warn;
use tracing::Instrument;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Filter;
use warp::Reply;

use crate::dispatcher::QueryDispatcher;
use crate::error::GatewayError;
use crate::metrics::Metrics;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Largest request body accepted, in bytes.
const MAX_BODY_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QueryRequestBody {
    /// Hex signature over the request digest. Empty or absent for unsigned requests.
    #[serde(default)]
    pub signature: String,

    /// Hex serialized query request.
    pub bytes: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QueryResponseBody {
    /// Hex serialized query response.
    pub bytes: String,

    /// Hex gateway signature over the response digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

pub fn routes(
    dispatcher: Arc<QueryDispatcher>
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let health = warp::path!("health")
        .and(warp::get())
        .map(|| warp::reply::with_status("OK", StatusCode::OK));

    let query = warp::path!("v1" / "query")
        .and(warp::put().or(warp::post()).unify())
        .and(warp::header::optional::<String>(API_KEY_HEADER))
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_dispatcher(dispatcher))
        .then(handle_query);

    health.or(query)
}

fn with_dispatcher(
    dispatcher: Arc<QueryDispatcher>
) -> impl Filter<Extract = (Arc<QueryDispatcher>,), Error = Infallible> + Clone {
    warp::any().map(move || dispatcher.clone())
}

async fn handle_query(
    api_key: Option<String>,
    body: bytes::Bytes,
    dispatcher: Arc<QueryDispatcher>,
) -> Response {
    let metrics = Metrics::new();
    metrics.increment_requests_received();

    let request_id = uuid::Uuid::new_v4();
    let span = info_span!("query", request_id = %request_id);

    let result = process_query(&dispatcher, api_key.as_deref(), &body)
        .instrument(span.clone())
        .await;

    let _guard = span.enter();
    match result {
        Ok(body) => {
            metrics.increment_requests_succeeded();
            info!("Query answered. request_id: {}", request_id);
            warp::reply::with_status(warp::reply::json(&body), StatusCode::OK).into_response()
        },
        Err(err) => {
            metrics.increment_requests_rejected(err.reason());
            warn!(
                "Query rejected. request_id: {} status: {} err: {}",
                request_id,
                err.status(),
                err
            );
            warp::reply::with_status(format!("{err}\n"), err.status()).into_response()
        },
    }
}

async fn process_query(
    dispatcher: &QueryDispatcher,
    api_key: Option<&str>,
    body: &[u8],
) -> Result<QueryResponseBody, GatewayError> {
    // The caller is known before anything in the body is looked at.
    let permissions = dispatcher.authenticate(api_key)?;

    let body: QueryRequestBody =
        serde_json::from_slice(body).map_err(|err| GatewayError::InvalidBody(err.to_string()))?;
    let signed = SignedQueryRequest::from_hex(&body.bytes, &body.signature)?;

    let outcome = dispatcher.dispatch(&permissions, signed).await?;

    Ok(QueryResponseBody {
        bytes: hex::encode(&outcome.response_bytes),
        signature: outcome.response_signature.map(hex::encode),
    })
}
