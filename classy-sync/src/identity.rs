//! Identity change handling.
//!
//! Translates sign-in, sign-out and credential refreshes from the identity
//! collaborator into engine operations, and owns the push-routing
//! registration of this app install.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, instrument, warn};

use crate::{
    engine::{PassOutcome, ReconciliationEngine},
    error::Result,
    models::{AccountCredential, InstanceRegistration},
    reliability::{RetryPolicy, retry_with_backoff},
    remote::RemoteStatusClient,
};

/// Events emitted by the identity collaborator.
#[derive(Debug, Clone)]
pub enum IdentityEvent {
    /// A user signed in, or the device switched to another account.
    SignedIn(AccountCredential),
    /// The user signed out.
    SignedOut,
    /// The identity provider issued a fresh token.
    CredentialRefreshed(AccountCredential),
}

/// Drives the engine from identity events.
pub struct IdentityChangeHandler<C> {
    engine: Arc<ReconciliationEngine<C>>,
    client: Arc<C>,
    instance_id: Option<String>,
    policy: RetryPolicy,
    registration: Mutex<Option<InstanceRegistration>>,
}

impl<C> std::fmt::Debug for IdentityChangeHandler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityChangeHandler")
            .field("instance_id", &self.instance_id)
            .field("registration", &self.registration())
            .finish_non_exhaustive()
    }
}

impl<C> IdentityChangeHandler<C> {
    /// Current push-routing registration, if any.
    #[must_use]
    pub fn registration(&self) -> Option<InstanceRegistration> {
        self.registration.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<C: RemoteStatusClient> IdentityChangeHandler<C> {
    /// Creates a handler. Without an `instance_id` no push registration is
    /// made.
    #[must_use]
    pub fn new(
        engine: Arc<ReconciliationEngine<C>>,
        client: Arc<C>,
        instance_id: Option<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self { engine, client, instance_id, policy, registration: Mutex::new(None) }
    }

    /// Applies an identity event.
    ///
    /// Instance-id registration and removal are best-effort: failures are
    /// logged and never change the returned outcome.
    ///
    /// # Errors
    ///
    /// Returns the failure of the refresh that follows a sign-in or a
    /// credential refresh.
    #[instrument(skip(self, event))]
    pub async fn handle(&self, event: IdentityEvent) -> Result<PassOutcome> {
        match event {
            IdentityEvent::SignedIn(credential) => self.sign_in(credential).await,
            IdentityEvent::SignedOut => {
                self.sign_out().await;
                Ok(PassOutcome::Applied)
            }
            IdentityEvent::CredentialRefreshed(credential) => {
                if self.engine.current_account().as_ref() == Some(credential.account_id()) {
                    self.engine.update_credential(credential)?;
                    self.engine.refresh().await
                } else {
                    self.sign_in(credential).await
                }
            }
        }
    }

    async fn sign_in(&self, credential: AccountCredential) -> Result<PassOutcome> {
        let outcome = self.engine.switch_account(credential.clone()).await;
        self.register_instance(&credential).await;
        outcome
    }

    async fn sign_out(&self) {
        let previous = self.engine.sign_out();
        let registration = self.registration.lock().unwrap_or_else(PoisonError::into_inner).take();

        let (Some(credential), Some(registration)) = (previous, registration) else {
            return;
        };
        if &registration.account_id != credential.account_id() {
            return;
        }
        match self.client.unregister_instance_id(&credential, &registration.instance_id).await {
            Ok(_) => info!(account = %registration.account_id, "Instance id unregistered"),
            Err(e) => warn!(
                account = %registration.account_id,
                error = %e,
                "Failed to unregister instance id"
            ),
        }
    }

    async fn register_instance(&self, credential: &AccountCredential) {
        let Some(instance_id) = self.instance_id.as_deref() else {
            return;
        };
        if self
            .registration()
            .is_some_and(|current| &current.account_id == credential.account_id())
        {
            return;
        }

        let result = retry_with_backoff(&self.policy, || {
            self.client.register_instance_id(credential, instance_id)
        })
        .await;

        match result {
            Ok(_) => {
                *self.registration.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(InstanceRegistration {
                        instance_id: instance_id.to_owned(),
                        account_id: credential.account_id().clone(),
                    });
                info!(account = %credential.account_id(), "Instance id registered");
            }
            Err(e) => {
                warn!(account = %credential.account_id(), error = %e, "Failed to register instance id");
            }
        }
    }
}
