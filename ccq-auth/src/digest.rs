//! Domain-separated digests over serialized queries.
use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use alloy_primitives::keccak256;
use alloy_primitives::Keccak256;
use alloy_primitives::B256;
use serde_derive::Deserialize;
use serde_derive::Serialize;

const MAINNET_QUERY_REQUEST_PREFIX: &[u8] = b"mainnet_query_request_000000000000|";
const TESTNET_QUERY_REQUEST_PREFIX: &[u8] = b"testnet_query_request_000000000000|";
const DEVNET_QUERY_REQUEST_PREFIX: &[u8] = b"devnet_query_request_0000000000000|";

/// Prefix of the digest a gateway signs over a serialized response.
pub const QUERY_RESPONSE_PREFIX: &[u8] = b"query_response_0000000000000000000|";

/// Deployment a request is bound to. A signature made for one environment
/// never verifies in another.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Mainnet,
    Testnet,
    Devnet,
}

impl Environment {
    pub fn query_request_prefix(self) -> &'static [u8] {
        match self {
            Environment::Mainnet => MAINNET_QUERY_REQUEST_PREFIX,
            Environment::Testnet => TESTNET_QUERY_REQUEST_PREFIX,
            Environment::Devnet => DEVNET_QUERY_REQUEST_PREFIX,
        }
    }
}

impl Display for Environment {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Environment::Mainnet => write!(f, "mainnet"),
            Environment::Testnet => write!(f, "testnet"),
            Environment::Devnet => write!(f, "devnet"),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Environment::Mainnet),
            "testnet" => Ok(Environment::Testnet),
            "devnet" => Ok(Environment::Devnet),
            other => Err(format!("unknown environment `{other}`")),
        }
    }
}

/// `keccak256(prefix(env) || request_bytes)`, the digest a client signs.
pub fn query_request_digest(
    env: Environment,
    request_bytes: &[u8],
) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(env.query_request_prefix());
    hasher.update(request_bytes);
    hasher.finalize()
}

/// `keccak256(QUERY_RESPONSE_PREFIX || keccak256(response_bytes))`, the digest a gateway signs.
pub fn query_response_digest(response_bytes: &[u8]) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(QUERY_RESPONSE_PREFIX);
    hasher.update(keccak256(response_bytes));
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "0100000001010005010000004600000009307832386439363330020d500b1d8e8ef31e21c99d1db9a6444d3adf12700000000406fdde030d500b1d8e8ef31e21c99d1db9a6444d3adf12700000000418160ddd";

    #[test]
    fn digest_is_deterministic() -> anyhow::Result<()> {
        let bytes = hex::decode(REQUEST)?;
        assert_eq!(
            query_request_digest(Environment::Devnet, &bytes),
            query_request_digest(Environment::Devnet, &bytes)
        );
        Ok(())
    }

    #[test]
    fn digest_is_the_hash_of_prefix_and_bytes() -> anyhow::Result<()> {
        let bytes = hex::decode(REQUEST)?;
        let mut preimage = b"testnet_query_request_000000000000|".to_vec();
        preimage.extend_from_slice(&bytes);
        assert_eq!(
            query_request_digest(Environment::Testnet, &bytes),
            keccak256(&preimage)
        );
        Ok(())
    }

    #[test]
    fn environments_are_separated() -> anyhow::Result<()> {
        let bytes = hex::decode(REQUEST)?;
        let mainnet = query_request_digest(Environment::Mainnet, &bytes);
        let testnet = query_request_digest(Environment::Testnet, &bytes);
        let devnet = query_request_digest(Environment::Devnet, &bytes);
        assert_ne!(mainnet, testnet);
        assert_ne!(mainnet, devnet);
        assert_ne!(testnet, devnet);
        Ok(())
    }

    #[test]
    fn prefixes_have_equal_length() {
        for env in [
            Environment::Mainnet,
            Environment::Testnet,
            Environment::Devnet,
        ] {
            assert_eq!(env.query_request_prefix().len(), 35);
        }
        assert_eq!(QUERY_RESPONSE_PREFIX.len(), 35);
    }

    #[test]
    fn response_digest_hashes_the_response_hash() {
        let bytes = [1u8, 2, 3];
        let mut preimage = QUERY_RESPONSE_PREFIX.to_vec();
        preimage.extend_from_slice(keccak256(bytes).as_slice());
        assert_eq!(query_response_digest(&bytes), keccak256(&preimage));
    }

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("DEVNET".parse::<Environment>(), Ok(Environment::Devnet));
        assert_eq!(Environment::Testnet.to_string(), "testnet");
        assert!("localnet".parse::<Environment>().is_err());
    }
}
