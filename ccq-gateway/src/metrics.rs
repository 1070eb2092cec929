use ccq_messages::ChainId;
use ccq_messages::QueryType;
use metrics::counter;
use metrics::histogram;

#[derive(Clone, Debug, Default)]
pub struct Metrics {}

impl Metrics {
    pub fn new() -> Self {
        Self {}
    }

    pub fn increment_requests_received(&self) {
        counter!("ccq_gateway_requests_received_total").increment(1);
    }

    pub fn increment_requests_rejected(
        &self,
        reason: &'static str,
    ) {
        counter!("ccq_gateway_requests_rejected_total", "reason" => reason).increment(1);
    }

    pub fn increment_requests_succeeded(&self) {
        counter!("ccq_gateway_requests_succeeded_total").increment(1);
    }

    pub fn observe_query_duration(
        &self,
        query_type: QueryType,
        duration: f64,
    ) {
        histogram!("ccq_gateway_query_duration_seconds", "query_type" => query_type.name())
            .record(duration);
    }

    pub fn increment_chain_errors(
        &self,
        chain_id: ChainId,
    ) {
        counter!("ccq_gateway_chain_errors_total", "chain_id" => chain_id.to_string()).increment(1);
    }
}
