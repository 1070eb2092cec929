use std::fmt::Display;
use std::fmt::Formatter;

use alloy_primitives::Bytes;
use bytes::BufMut;
use derive_debug_plus::Dbg;
use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::codec;
use crate::codec::DecodeError;
use crate::codec::EncodeError;
use crate::codec::Reader;
use crate::types::eth_call::EthCallQueryRequest;
use crate::types::eth_call::EthCallQueryResponse;
use crate::ChainId;
use crate::Nonce;
use crate::RawSignature;
use crate::MSG_VERSION;
use crate::SIGNATURE_LEN;

pub mod eth_call;

/// Numeric tag selecting the layout of a per-chain payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[repr(u8)]
pub enum QueryType {
    EthCall = 1,
}

impl QueryType {
    pub const ALL: [QueryType; 1] = [QueryType::EthCall];

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Name used in call fingerprints and permission files.
    pub fn name(self) -> &'static str {
        match self {
            QueryType::EthCall => "ethCall",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|query_type| query_type.name() == name)
    }
}

impl TryFrom<u8> for QueryType {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|query_type| query_type.tag() == tag)
            .ok_or(DecodeError::UnknownQueryType(tag))
    }
}

impl Display for QueryType {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A batch of chain-targeted queries, signed as one unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRequest {
    pub version: u8,
    pub nonce: Nonce,
    pub per_chain_queries: Vec<PerChainQueryRequest>,
}

impl QueryRequest {
    pub fn new(
        nonce: Nonce,
        per_chain_queries: Vec<PerChainQueryRequest>,
    ) -> Self {
        Self {
            version: MSG_VERSION,
            nonce,
            per_chain_queries,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        if self.version != MSG_VERSION {
            return Err(EncodeError::UnsupportedVersion(self.version));
        }

        let mut out = Vec::new();
        out.put_u8(self.version);
        out.put_u32(self.nonce);
        codec::put_count(&mut out, "per chain queries", self.per_chain_queries.len())?;
        for query in &self.per_chain_queries {
            query.write(&mut out)?;
        }
        Ok(out)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(data);

        let version = reader.u8("version")?;
        if version != MSG_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let nonce = reader.u32("nonce")?;

        let count = reader.count("per chain queries")?;
        let mut per_chain_queries = Vec::with_capacity(count);
        for _ in 0..count {
            per_chain_queries.push(PerChainQueryRequest::read(&mut reader)?);
        }
        reader.finish("query request")?;

        Ok(Self {
            version,
            nonce,
            per_chain_queries,
        })
    }

    /// Total number of atomic calls across all per-chain queries.
    pub fn call_count(&self) -> usize {
        self.per_chain_queries
            .iter()
            .map(|pcq| pcq.query.call_count())
            .sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerChainQueryRequest {
    pub chain_id: ChainId,
    pub query: ChainSpecificQuery,
}

impl PerChainQueryRequest {
    pub fn new(
        chain_id: ChainId,
        query: impl Into<ChainSpecificQuery>,
    ) -> Self {
        Self {
            chain_id,
            query: query.into(),
        }
    }

    fn write(
        &self,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodeError> {
        out.put_u16(self.chain_id);
        out.put_u8(self.query.query_type().tag());
        let payload = self.query.serialize()?;
        codec::put_blob(out, "per chain query payload", &payload)
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let chain_id = reader.u16("chain id")?;
        let query_type = QueryType::try_from(reader.u8("query type")?)?;
        let payload = reader.blob("per chain query payload")?;
        let query = ChainSpecificQuery::decode_payload(query_type, payload)?;

        Ok(Self { chain_id, query })
    }
}

/// Payload of a per-chain query, one variant per [`QueryType`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainSpecificQuery {
    EthCall(EthCallQueryRequest),
}

impl ChainSpecificQuery {
    pub fn query_type(&self) -> QueryType {
        match self {
            ChainSpecificQuery::EthCall(_) => QueryType::EthCall,
        }
    }

    pub fn call_count(&self) -> usize {
        match self {
            ChainSpecificQuery::EthCall(q) => q.calls.len(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            ChainSpecificQuery::EthCall(q) => q.serialize(),
        }
    }

    /// Decodes a length-framed payload; the payload must be consumed exactly.
    pub fn decode_payload(
        query_type: QueryType,
        payload: &[u8],
    ) -> Result<Self, DecodeError> {
        match query_type {
            QueryType::EthCall => Ok(Self::EthCall(EthCallQueryRequest::deserialize(payload)?)),
        }
    }
}

impl From<EthCallQueryRequest> for ChainSpecificQuery {
    fn from(query: EthCallQueryRequest) -> Self {
        ChainSpecificQuery::EthCall(query)
    }
}

/// What the gateway receives: the serialized request and the caller's signature over its digest.
#[derive(Clone, Dbg, PartialEq, Eq)]
pub struct SignedQueryRequest {
    pub request_bytes: Bytes,

    /// Left unchecked here; the length and recovery are verified by the auth layer.
    pub signature: Option<Bytes>,
}

impl SignedQueryRequest {
    pub fn new(
        request_bytes: impl Into<Bytes>,
        signature: Option<Bytes>,
    ) -> Self {
        Self {
            request_bytes: request_bytes.into(),
            signature,
        }
    }

    /// Builds a signed request from the hex strings carried by the HTTP body.
    /// An empty signature string marks the request as unsigned.
    pub fn from_hex(
        bytes_hex: &str,
        signature_hex: &str,
    ) -> Result<Self, DecodeError> {
        let request_bytes = codec::decode_hex("bytes", bytes_hex)?;
        if request_bytes.is_empty() {
            return Err(DecodeError::Empty { field: "bytes" });
        }

        let signature = codec::decode_hex("signature", signature_hex)?;
        let signature = (!signature.is_empty()).then(|| Bytes::from(signature));

        Ok(Self::new(request_bytes, signature))
    }
}

/// The answer to a [`QueryRequest`], carrying the request it answers.
#[derive(Clone, Dbg, PartialEq, Eq)]
pub struct QueryResponse {
    /// Signature of the originating request, echoed back.
    #[dbg(formatter = crate::hex_pretty)]
    pub signature: RawSignature,

    pub request_bytes: Bytes,

    /// Decoded form of `request_bytes`; not carried separately on the wire.
    #[dbg(skip)]
    pub request: QueryRequest,

    pub per_chain_responses: Vec<PerChainQueryResponse>,
}

impl QueryResponse {
    /// Pairs the responses with the entries of `request`, in order.
    pub fn new(
        signature: RawSignature,
        request_bytes: impl Into<Bytes>,
        request: QueryRequest,
        responses: Vec<ChainSpecificResponse>,
    ) -> Result<Self, EncodeError> {
        if responses.len() != request.per_chain_queries.len() {
            return Err(EncodeError::ResponseMismatch(format!(
                "{} responses for {} per chain queries",
                responses.len(),
                request.per_chain_queries.len()
            )));
        }

        let per_chain_responses = request
            .per_chain_queries
            .iter()
            .zip(responses)
            .map(|(query, response)| {
                PerChainQueryResponse {
                    chain_id: query.chain_id,
                    response,
                }
            })
            .collect();

        let response = Self {
            signature,
            request_bytes: request_bytes.into(),
            request,
            per_chain_responses,
        };
        response.check_pairing()?;

        Ok(response)
    }

    fn check_pairing(&self) -> Result<(), EncodeError> {
        if self.request.serialize()?[..] != self.request_bytes[..] {
            return Err(EncodeError::ResponseMismatch(
                "request bytes are not the encoding of the request".to_string(),
            ));
        }
        if self.per_chain_responses.len() != self.request.per_chain_queries.len() {
            return Err(EncodeError::ResponseMismatch(format!(
                "{} responses for {} per chain queries",
                self.per_chain_responses.len(),
                self.request.per_chain_queries.len()
            )));
        }
        for (idx, (query, response)) in self
            .request
            .per_chain_queries
            .iter()
            .zip(&self.per_chain_responses)
            .enumerate()
        {
            if query.query.query_type() != response.response.query_type() {
                return Err(EncodeError::ResponseMismatch(format!(
                    "response {idx} is {} but the query is {}",
                    response.response.query_type(),
                    query.query.query_type()
                )));
            }
        }
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        self.check_pairing()?;

        let mut out = Vec::new();
        out.put_slice(&self.signature);
        codec::put_blob(&mut out, "request bytes", &self.request_bytes)?;
        codec::put_count(&mut out, "per chain responses", self.per_chain_responses.len())?;
        for response in &self.per_chain_responses {
            let payload = response.response.serialize()?;
            codec::put_blob(&mut out, "per chain response", &payload)?;
        }
        Ok(out)
    }

    /// Decodes a response. The embedded request decides the type of each per-chain response.
    pub fn deserialize(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(data);

        let signature = reader.array::<SIGNATURE_LEN>("signature")?;
        let request_bytes = reader.blob("request bytes")?;
        let request = QueryRequest::deserialize(request_bytes)?;

        let count = reader.count("per chain responses")?;
        if count != request.per_chain_queries.len() {
            return Err(DecodeError::ResponseMismatch(format!(
                "{count} responses for {} per chain queries",
                request.per_chain_queries.len()
            )));
        }

        let mut per_chain_responses = Vec::with_capacity(count);
        for query in &request.per_chain_queries {
            let payload = reader.blob("per chain response")?;
            let response = ChainSpecificResponse::decode_payload(query.query.query_type(), payload)?;
            per_chain_responses.push(PerChainQueryResponse {
                chain_id: query.chain_id,
                response,
            });
        }
        reader.finish("query response")?;

        Ok(Self {
            signature,
            request_bytes: Bytes::copy_from_slice(request_bytes),
            request,
            per_chain_responses,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerChainQueryResponse {
    /// Copied from the paired request entry.
    pub chain_id: ChainId,
    pub response: ChainSpecificResponse,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainSpecificResponse {
    EthCall(EthCallQueryResponse),
}

impl ChainSpecificResponse {
    pub fn query_type(&self) -> QueryType {
        match self {
            ChainSpecificResponse::EthCall(_) => QueryType::EthCall,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            ChainSpecificResponse::EthCall(r) => r.serialize(),
        }
    }

    pub fn decode_payload(
        query_type: QueryType,
        payload: &[u8],
    ) -> Result<Self, DecodeError> {
        match query_type {
            QueryType::EthCall => Ok(Self::EthCall(EthCallQueryResponse::deserialize(payload)?)),
        }
    }
}

impl From<EthCallQueryResponse> for ChainSpecificResponse {
    fn from(response: EthCallQueryResponse) -> Self {
        ChainSpecificResponse::EthCall(response)
    }
}
