/// Type-state markers for the builder pattern
///
/// A client cannot be built until it knows how to authenticate; the marker
/// records at compile time whether a credential source has been set.

/// Marker trait for credential state
pub trait CredentialState {}

/// No key, token or auth provider yet
pub struct NoCredentials;
impl CredentialState for NoCredentials {}

/// A credential source has been set
pub struct HasCredentials;
impl CredentialState for HasCredentials {}
