//! EVM `eth_call` payloads.
use alloy_primitives::Address;
use alloy_primitives::Bytes;
use alloy_primitives::B256;
use bytes::BufMut;

use crate::codec;
use crate::codec::DecodeError;
use crate::codec::EncodeError;
use crate::codec::Reader;

/// Length of an ABI function selector.
pub const SELECTOR_LEN: usize = 4;

/// A single read-only contract call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthCallData {
    pub to: Address,
    /// ABI-encoded call, selector first.
    pub data: Bytes,
}

impl EthCallData {
    pub fn new(
        to: Address,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            to,
            data: data.into(),
        }
    }

    /// The function selector, if the call data is long enough to carry one.
    pub fn selector(&self) -> Option<[u8; SELECTOR_LEN]> {
        self.data
            .get(..SELECTOR_LEN)
            .and_then(|s| s.try_into().ok())
    }
}

/// A batch of calls evaluated against the same block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthCallQueryRequest {
    /// Hex block number (`0x28d9630`) or a named tag (`latest`, `safe`, `finalized`).
    pub block_tag: String,
    pub calls: Vec<EthCallData>,
}

impl EthCallQueryRequest {
    pub fn new(
        block_tag: impl Into<String>,
        calls: Vec<EthCallData>,
    ) -> Self {
        Self {
            block_tag: block_tag.into(),
            calls,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        if self.block_tag.is_empty() {
            return Err(EncodeError::Empty { field: "block tag" });
        }

        let mut out = Vec::new();
        codec::put_blob(&mut out, "block tag", self.block_tag.as_bytes())?;
        codec::put_count(&mut out, "eth calls", self.calls.len())?;
        for call in &self.calls {
            out.put_slice(call.to.as_slice());
            codec::put_blob(&mut out, "call data", &call.data)?;
        }
        Ok(out)
    }

    pub fn deserialize(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(payload);

        let block_tag = reader.blob("block tag")?;
        if block_tag.is_empty() {
            return Err(DecodeError::Empty { field: "block tag" });
        }
        let block_tag = std::str::from_utf8(block_tag)
            .map_err(|_| DecodeError::InvalidUtf8 { field: "block tag" })?
            .to_owned();

        let count = reader.count("eth calls")?;
        let mut calls = Vec::with_capacity(count);
        for _ in 0..count {
            let to = Address::from(reader.array::<20>("call target")?);
            let data = Bytes::copy_from_slice(reader.blob("call data")?);
            calls.push(EthCallData { to, data });
        }
        reader.finish("eth call query request")?;

        Ok(Self { block_tag, calls })
    }
}

/// Results of an [`EthCallQueryRequest`], one per call, all observed at one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthCallQueryResponse {
    pub block_number: u64,
    pub block_hash: B256,
    /// Block timestamp in microseconds.
    pub block_time: u64,
    pub results: Vec<Bytes>,
}

impl EthCallQueryResponse {
    pub fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        out.put_u64(self.block_number);
        out.put_slice(self.block_hash.as_slice());
        out.put_u64(self.block_time);
        codec::put_count(&mut out, "call results", self.results.len())?;
        for result in &self.results {
            codec::put_blob(&mut out, "call result", result)?;
        }
        Ok(out)
    }

    pub fn deserialize(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(payload);

        let block_number = reader.u64("block number")?;
        let block_hash = B256::from(reader.array::<32>("block hash")?);
        let block_time = reader.u64("block time")?;

        let count = reader.count("call results")?;
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            results.push(Bytes::copy_from_slice(reader.blob("call result")?));
        }
        reader.finish("eth call query response")?;

        Ok(Self {
            block_number,
            block_hash,
            block_time,
            results,
        })
    }
}
