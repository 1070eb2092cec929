//! API-key permissions for individual calls.
//!
//! Every atomic call in a request is reduced to a [`CallFingerprint`]; a caller
//! may only run a request whose fingerprints are all allowed by its policy.
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::Address;
use arc_swap::ArcSwap;
use ccq_messages::ChainId;
use ccq_messages::QueryType;
use thiserror::Error;
use tracing::debug;
use tracing::info;

/// Width addresses are padded to in fingerprints, wide enough for any chain family.
pub const ADDRESS_LEN: usize = 32;

pub const SELECTOR_LEN: usize = 4;

const WILDCARD: &str = "*";

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("api key is missing")]
    MissingApiKey,

    #[error("invalid api key")]
    InvalidApiKey,
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("call \"{0}\" not authorized")]
    CallNotAuthorized(CallFingerprint),

    #[error("invalid call {index} on chain {chain_id}: {reason}")]
    MalformedCall {
        chain_id: ChainId,
        index: usize,
        reason: &'static str,
    },

    #[error("signer {0} not authorized for this api key")]
    SignerNotAuthorized(Address),
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum PermissionsError {
    #[error("invalid call pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid signer `{0}`")]
    InvalidSigner(String),

    #[error("duplicate api key configured for user `{0}`")]
    DuplicateApiKey(String),
}

/// Identity of one atomic call: `(query type, chain, target, selector)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallFingerprint {
    pub query_type: QueryType,
    pub chain_id: ChainId,
    pub address: [u8; ADDRESS_LEN],
    pub selector: [u8; SELECTOR_LEN],
}

impl CallFingerprint {
    /// Builds a fingerprint, left-padding `address` with zeros to [`ADDRESS_LEN`] bytes.
    ///
    /// Addresses wider than [`ADDRESS_LEN`] are not representable and yield `None`.
    pub fn new(
        query_type: QueryType,
        chain_id: ChainId,
        address: &[u8],
        selector: [u8; SELECTOR_LEN],
    ) -> Option<Self> {
        Some(Self {
            query_type,
            chain_id,
            address: pad_address(address)?,
            selector,
        })
    }
}

impl Display for CallFingerprint {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.query_type,
            self.chain_id,
            hex::encode(self.address),
            hex::encode(self.selector)
        )
    }
}

fn pad_address(address: &[u8]) -> Option<[u8; ADDRESS_LEN]> {
    if address.len() > ADDRESS_LEN {
        return None;
    }
    let mut padded = [0u8; ADDRESS_LEN];
    padded[ADDRESS_LEN - address.len()..].copy_from_slice(address);
    Some(padded)
}

/// One segment of a [`CallPattern`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Segment<T> {
    Any,
    Exact(T),
}

impl<T: PartialEq> Segment<T> {
    fn matches(
        &self,
        value: &T,
    ) -> bool {
        match self {
            Segment::Any => true,
            Segment::Exact(expected) => expected == value,
        }
    }

    fn exact(&self) -> Option<&T> {
        match self {
            Segment::Any => None,
            Segment::Exact(value) => Some(value),
        }
    }
}

/// A permitted fingerprint, where any segment may be the wildcard `*`.
///
/// Written `"<type>:<chain>:<address>:<selector>"`, e.g.
/// `ethCall:2:0xDDb64fE46a91D46ee29420539FC25FD07c5FEa3E:*`. Addresses may be
/// 20 or 32 bytes, in any case, with or without `0x`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallPattern {
    pub query_type: Segment<QueryType>,
    pub chain_id: Segment<ChainId>,
    pub address: Segment<[u8; ADDRESS_LEN]>,
    pub selector: Segment<[u8; SELECTOR_LEN]>,
}

impl CallPattern {
    pub fn matches(
        &self,
        fingerprint: &CallFingerprint,
    ) -> bool {
        self.query_type.matches(&fingerprint.query_type)
            && self.chain_id.matches(&fingerprint.chain_id)
            && self.address.matches(&fingerprint.address)
            && self.selector.matches(&fingerprint.selector)
    }

    /// The single fingerprint this pattern allows, if it has no wildcard.
    pub fn as_fingerprint(&self) -> Option<CallFingerprint> {
        Some(CallFingerprint {
            query_type: *self.query_type.exact()?,
            chain_id: *self.chain_id.exact()?,
            address: *self.address.exact()?,
            selector: *self.selector.exact()?,
        })
    }
}

impl From<CallFingerprint> for CallPattern {
    fn from(fingerprint: CallFingerprint) -> Self {
        Self {
            query_type: Segment::Exact(fingerprint.query_type),
            chain_id: Segment::Exact(fingerprint.chain_id),
            address: Segment::Exact(fingerprint.address),
            selector: Segment::Exact(fingerprint.selector),
        }
    }
}

impl FromStr for CallPattern {
    type Err = PermissionsError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| {
            PermissionsError::InvalidPattern {
                pattern: pattern.to_owned(),
                reason,
            }
        };

        let parts: Vec<&str> = pattern.trim().split(':').collect();
        let [query_type, chain_id, address, selector] = parts.as_slice() else {
            return Err(invalid(format!(
                "expected 4 `:`-separated segments, found {}",
                parts.len()
            )));
        };

        let query_type = parse_segment(query_type, |s| {
            QueryType::from_name(s).ok_or_else(|| format!("unknown query type `{s}`"))
        })
        .map_err(invalid)?;

        let chain_id = parse_segment(chain_id, |s| {
            s.parse::<ChainId>()
                .map_err(|err| format!("invalid chain id `{s}`: {err}"))
        })
        .map_err(invalid)?;

        let address = parse_segment(address, |s| {
            let bytes = decode_hex(s).map_err(|err| format!("invalid address `{s}`: {err}"))?;
            match bytes.len() {
                20 | ADDRESS_LEN => {
                    pad_address(&bytes).ok_or_else(|| format!("invalid address `{s}`"))
                },
                len => Err(format!("address must be 20 or 32 bytes, got {len}")),
            }
        })
        .map_err(invalid)?;

        let selector = parse_segment(selector, |s| {
            let bytes = decode_hex(s).map_err(|err| format!("invalid selector `{s}`: {err}"))?;
            <[u8; SELECTOR_LEN]>::try_from(bytes.as_slice())
                .map_err(|_| format!("selector must be {SELECTOR_LEN} bytes, got {}", bytes.len()))
        })
        .map_err(invalid)?;

        Ok(Self {
            query_type,
            chain_id,
            address,
            selector,
        })
    }
}

fn parse_segment<T>(
    segment: &str,
    parse: impl FnOnce(&str) -> Result<T, String>,
) -> Result<Segment<T>, String> {
    match segment.trim() {
        WILDCARD => Ok(Segment::Any),
        s => parse(s).map(Segment::Exact),
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
}

/// What one API key is allowed to do.
#[derive(Clone, Debug, Default)]
pub struct Permissions {
    user_name: String,

    /// Fingerprints without wildcards, checked first.
    exact_calls: HashSet<CallFingerprint>,

    /// Patterns with at least one wildcard.
    patterns: Vec<CallPattern>,

    /// When set, the recovered request signer must be one of these.
    allowed_signers: Option<HashSet<Address>>,
}

impl Permissions {
    pub fn new(
        user_name: impl Into<String>,
        allowed_calls: impl IntoIterator<Item = CallPattern>,
    ) -> Self {
        let mut permissions = Self {
            user_name: user_name.into(),
            ..Default::default()
        };
        for pattern in allowed_calls {
            match pattern.as_fingerprint() {
                Some(fingerprint) => {
                    permissions.exact_calls.insert(fingerprint);
                },
                None => permissions.patterns.push(pattern),
            }
        }
        permissions
    }

    /// Builds permissions from their textual form, as found in configuration files.
    pub fn parse<S: AsRef<str>>(
        user_name: impl Into<String>,
        allowed_calls: &[S],
        allowed_signers: Option<&[S]>,
    ) -> Result<Self, PermissionsError> {
        let patterns = allowed_calls
            .iter()
            .map(|call| call.as_ref().parse::<CallPattern>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut permissions = Self::new(user_name, patterns);
        if let Some(signers) = allowed_signers {
            let signers = signers
                .iter()
                .map(|signer| {
                    signer
                        .as_ref()
                        .trim()
                        .parse::<Address>()
                        .map_err(|_| PermissionsError::InvalidSigner(signer.as_ref().to_owned()))
                })
                .collect::<Result<HashSet<_>, _>>()?;
            permissions = permissions.with_allowed_signers(signers);
        }
        Ok(permissions)
    }

    pub fn with_allowed_signers(
        mut self,
        signers: impl IntoIterator<Item = Address>,
    ) -> Self {
        self.allowed_signers = Some(signers.into_iter().collect());
        self
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn authorize(
        &self,
        fingerprint: &CallFingerprint,
    ) -> Result<(), AuthorizationError> {
        if self.exact_calls.contains(fingerprint)
            || self
                .patterns
                .iter()
                .any(|pattern| pattern.matches(fingerprint))
        {
            return Ok(());
        }

        debug!(
            "Call denied. user: {} fingerprint: {}",
            self.user_name, fingerprint
        );
        Err(AuthorizationError::CallNotAuthorized(*fingerprint))
    }

    /// Authorizes a whole request. The first denied call rejects all of them.
    pub fn authorize_all<'a>(
        &self,
        fingerprints: impl IntoIterator<Item = &'a CallFingerprint>,
    ) -> Result<(), AuthorizationError> {
        fingerprints
            .into_iter()
            .try_for_each(|fingerprint| self.authorize(fingerprint))
    }

    pub fn authorize_signer(
        &self,
        signer: Address,
    ) -> Result<(), AuthorizationError> {
        match &self.allowed_signers {
            Some(allowed) if !allowed.contains(&signer) => {
                Err(AuthorizationError::SignerNotAuthorized(signer))
            },
            _ => Ok(()),
        }
    }
}

/// Immutable mapping from API key to permissions.
#[derive(Clone, Debug, Default)]
pub struct PolicySet {
    by_api_key: HashMap<String, Arc<Permissions>>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        api_key: impl Into<String>,
        permissions: Permissions,
    ) -> Result<(), PermissionsError> {
        let user_name = permissions.user_name.clone();
        match self.by_api_key.insert(api_key.into(), Arc::new(permissions)) {
            Some(_) => Err(PermissionsError::DuplicateApiKey(user_name)),
            None => Ok(()),
        }
    }

    pub fn get(
        &self,
        api_key: &str,
    ) -> Option<Arc<Permissions>> {
        self.by_api_key.get(api_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_api_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_api_key.is_empty()
    }
}

/// Source of permissions for API keys.
pub trait ApiKeyStore: Send + Sync {
    fn lookup(
        &self,
        api_key: &str,
    ) -> Option<Arc<Permissions>>;
}

impl ApiKeyStore for PolicySet {
    fn lookup(
        &self,
        api_key: &str,
    ) -> Option<Arc<Permissions>> {
        self.get(api_key)
    }
}

/// A [`PolicySet`] that can be replaced while requests are in flight.
///
/// Readers get a whole snapshot; a reload is never observed half applied.
#[derive(Debug, Default)]
pub struct PolicyStore {
    current: ArcSwap<PolicySet>,
}

impl PolicyStore {
    pub fn new(policy: PolicySet) -> Self {
        Self {
            current: ArcSwap::from_pointee(policy),
        }
    }

    pub fn snapshot(&self) -> Arc<PolicySet> {
        self.current.load_full()
    }

    pub fn reload(
        &self,
        policy: PolicySet,
    ) {
        info!("Reloading permissions. api_keys: {}", policy.len());
        self.current.store(Arc::new(policy));
    }
}

impl ApiKeyStore for PolicyStore {
    fn lookup(
        &self,
        api_key: &str,
    ) -> Option<Arc<Permissions>> {
        self.current.load().get(api_key)
    }
}

/// Resolves the presented API key. Runs before the request body is looked at.
pub fn authenticate(
    store: &dyn ApiKeyStore,
    api_key: Option<&str>,
) -> Result<Arc<Permissions>, AuthenticationError> {
    let api_key = api_key
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(AuthenticationError::MissingApiKey)?;

    store
        .lookup(api_key)
        .ok_or(AuthenticationError::InvalidApiKey)
}
