use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::AuthError;
use crate::gateway::{Identity, IdentityProvider, MetadataGateway, StorageGateway};

/// Per-session context: the gateways and the signed-in identity.
///
/// Created at session start and shared (behind `Arc`) by the intake
/// pipeline and the gallery view model. Storage and metadata calls are
/// only made once an identity has been issued.
pub struct Session {
    storage: Arc<dyn StorageGateway>,
    metadata: Arc<dyn MetadataGateway>,
    identity_provider: Arc<dyn IdentityProvider>,
    auth: Mutex<AuthState>,
}

#[derive(Debug, Clone)]
enum AuthState {
    SignedOut,
    SignedIn(Identity),
    /// Last sign-in attempt failed; reported until the next attempt
    Failed(AuthError),
}

impl Session {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        metadata: Arc<dyn MetadataGateway>,
        identity_provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            storage,
            metadata,
            identity_provider,
            auth: Mutex::new(AuthState::SignedOut),
        }
    }

    /// Sign in anonymously. Returns the existing identity if already
    /// signed in; a failure leaves the session blocked and may be retried.
    pub async fn sign_in(&self) -> Result<Identity, AuthError> {
        if let Some(identity) = self.identity() {
            return Ok(identity);
        }
        match self.identity_provider.sign_in_anonymous().await {
            Ok(identity) => {
                tracing::info!(uid = %identity.uid, "signed in anonymously");
                *self.auth.lock() = AuthState::SignedIn(identity.clone());
                Ok(identity)
            }
            Err(e) => {
                let err = AuthError::SignInFailed(format!("{:#}", e));
                tracing::warn!("{}", err);
                *self.auth.lock() = AuthState::Failed(err.clone());
                Err(err)
            }
        }
    }

    pub fn sign_out(&self) {
        let previous = std::mem::replace(&mut *self.auth.lock(), AuthState::SignedOut);
        if matches!(previous, AuthState::SignedIn(_)) {
            tracing::info!("signed out");
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        match &*self.auth.lock() {
            AuthState::SignedIn(identity) => Some(identity.clone()),
            _ => None,
        }
    }

    /// The signed-in identity, or why there is none.
    pub fn require_identity(&self) -> Result<Identity, AuthError> {
        match &*self.auth.lock() {
            AuthState::SignedIn(identity) => Ok(identity.clone()),
            AuthState::SignedOut => Err(AuthError::NotSignedIn),
            AuthState::Failed(err) => Err(err.clone()),
        }
    }

    pub fn storage(&self) -> &dyn StorageGateway {
        self.storage.as_ref()
    }

    pub fn metadata(&self) -> &dyn MetadataGateway {
        self.metadata.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AnonymousIdentity, MemoryMetadata, MemoryStorage};
    use async_trait::async_trait;

    struct Refusing;

    #[async_trait]
    impl IdentityProvider for Refusing {
        async fn sign_in_anonymous(&self) -> anyhow::Result<Identity> {
            anyhow::bail!("anonymous auth disabled")
        }
    }

    fn session(provider: Arc<dyn IdentityProvider>) -> Session {
        Session::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryMetadata::new()), provider)
    }

    #[tokio::test]
    async fn test_sign_in_is_sticky() {
        let session = session(Arc::new(AnonymousIdentity));
        assert_eq!(session.require_identity(), Err(AuthError::NotSignedIn));

        let first = session.sign_in().await.unwrap();
        let second = session.sign_in().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(session.require_identity().unwrap(), first);

        session.sign_out();
        assert!(session.identity().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_failure_blocks_with_reason() {
        let session = session(Arc::new(Refusing));
        let err = session.sign_in().await.unwrap_err();
        assert!(matches!(err, AuthError::SignInFailed(ref m) if m.contains("disabled")));
        // Later callers see the same reason, not a bare NotSignedIn
        assert_eq!(session.require_identity(), Err(err));
        assert!(session.identity().is_none());

        session.sign_out();
        assert_eq!(session.require_identity(), Err(AuthError::NotSignedIn));
    }
}
