//! Canonical binary encoding of cross-chain query requests and responses.
pub mod codec;
pub mod types;

pub use codec::DecodeError;
pub use codec::EncodeError;
pub use types::eth_call::EthCallData;
pub use types::eth_call::EthCallQueryRequest;
pub use types::eth_call::EthCallQueryResponse;
pub use types::ChainSpecificQuery;
pub use types::ChainSpecificResponse;
pub use types::PerChainQueryRequest;
pub use types::PerChainQueryResponse;
pub use types::QueryRequest;
pub use types::QueryResponse;
pub use types::QueryType;
pub use types::SignedQueryRequest;

pub type ChainId = u16;
pub type Nonce = u32;

/// Length of a recoverable secp256k1 signature, `r || s || v`.
pub const SIGNATURE_LEN: usize = 65;

pub type RawSignature = [u8; SIGNATURE_LEN];

/// Current (and only) version of the request layout.
pub const MSG_VERSION: u8 = 1;

/// Hex rendering used by `Dbg` derives for raw byte fields.
pub fn hex_pretty<T: AsRef<[u8]>>(bytes: &T) -> String {
    format!("0x{}", hex::encode(bytes))
}
