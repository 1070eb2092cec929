//! Request authentication used by both the gateway and its clients: digests,
//! secp256k1 signatures and API-key permissions.
pub mod digest;
pub mod permissions;
pub mod signature;

pub use digest::query_request_digest;
pub use digest::query_response_digest;
pub use digest::Environment;
pub use permissions::authenticate;
pub use permissions::ApiKeyStore;
pub use permissions::AuthenticationError;
pub use permissions::AuthorizationError;
pub use permissions::CallFingerprint;
pub use permissions::CallPattern;
pub use permissions::Permissions;
pub use permissions::PermissionsError;
pub use permissions::PolicySet;
pub use permissions::PolicyStore;
pub use signature::QuerySigner;
pub use signature::SignatureError;
