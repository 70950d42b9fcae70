//! Subscription data models.
//!
//! Wire types use camelCase JSON keys to match the subscription-status
//! backend. Identifiers are newtypes so an account id can never be passed
//! where a purchase token is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Upper bound for identifier lengths accepted from callers.
const MAX_ID_LEN: usize = 256;

fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(SyncError::InvalidInput(format!("{kind} cannot be empty")));
    }
    if id.len() > MAX_ID_LEN {
        return Err(SyncError::InvalidInput(format!(
            "{kind} must be {MAX_ID_LEN} characters or less"
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(SyncError::InvalidInput(format!("{kind} cannot contain control characters")));
    }
    Ok(())
}

/// Opaque identifier of a signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Creates a new account id after validation.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidInput`] if the id is empty, too long, or
    /// contains control characters.
    pub fn new<S: Into<String>>(id: S) -> Result<Self> {
        let id = id.into();
        validate_id("account_id", &id)?;
        Ok(Self(id))
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Product identifier of a subscription (the Play Billing sku).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Creates a new subscription id after validation.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidInput`] if the id is empty, too long, or
    /// contains control characters.
    pub fn new<S: Into<String>>(id: S) -> Result<Self> {
        let id = id.into();
        validate_id("subscription_id", &id)?;
        Ok(Self(id))
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token issued by the billing platform for one purchase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseToken(String);

impl PurchaseToken {
    /// Creates a new purchase token after validation.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidInput`] if the token is empty, too long, or
    /// contains control characters.
    pub fn new<S: Into<String>>(token: S) -> Result<Self> {
        let token = token.into();
        validate_id("purchase_token", &token)?;
        Ok(Self(token))
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Platform on which the subscription is currently active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivePlatform {
    /// Purchased through this app.
    ThisApp,
    /// Purchased through another app sharing the backend.
    OtherApp,
    /// The server could not tell, or sent a value this build does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

/// One entitlement record as reported by the subscription-status backend.
///
/// Records are immutable snapshots of server state: the engine supersedes a
/// record as a whole and never patches individual fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    /// Subscription product id. Older servers call this field `sku`.
    #[serde(alias = "sku")]
    pub subscription_id: SubscriptionId,
    /// Purchase token the entitlement was granted for.
    pub purchase_token: PurchaseToken,
    /// Whether the account is entitled at all.
    #[serde(default)]
    pub is_entitled: bool,
    /// Whether the entitlement is currently active.
    #[serde(default)]
    pub is_entitlement_active: bool,
    /// Whether the subscription will renew at period end.
    #[serde(default)]
    pub will_renew: bool,
    /// Platform on which the subscription is active.
    #[serde(default)]
    pub active_platform: ActivePlatform,
    /// Account the record belongs to.
    #[serde(default)]
    pub account_id: Option<AccountId>,
    /// Plan the subscription renews into, if it differs from the current one.
    #[serde(default)]
    pub auto_renew_plan_id: Option<String>,
    /// End of the current entitlement period (epoch millis).
    #[serde(default)]
    pub active_until_millis: Option<i64>,
    /// Subscription is in a free trial.
    #[serde(default)]
    pub is_free_trial: bool,
    /// Payment failed; access continues during the grace period.
    #[serde(default)]
    pub is_grace_period: bool,
    /// Payment failed and access is suspended until the user fixes it.
    #[serde(default)]
    pub is_account_hold: bool,
    /// User paused the subscription.
    #[serde(default)]
    pub is_paused: bool,
    /// When a paused subscription resumes (epoch millis).
    #[serde(default)]
    pub auto_resume_time_millis: Option<i64>,
    /// The purchase is already owned by a different account.
    #[serde(default)]
    pub sub_already_owned: bool,
}

impl SubscriptionStatus {
    /// Builds the request body for register and transfer calls.
    ///
    /// Only the product id and purchase token are meaningful; the server fills
    /// in everything else.
    #[must_use]
    pub fn for_purchase(event: &PurchaseEvent) -> Self {
        Self {
            subscription_id: event.sku.clone(),
            purchase_token: event.purchase_token.clone(),
            is_entitled: false,
            is_entitlement_active: false,
            will_renew: false,
            active_platform: ActivePlatform::Unknown,
            account_id: None,
            auto_renew_plan_id: None,
            active_until_millis: None,
            is_free_trial: false,
            is_grace_period: false,
            is_account_hold: false,
            is_paused: false,
            auto_resume_time_millis: None,
            sub_already_owned: false,
        }
    }

    /// Returns `true` if this record grants the basic content tier.
    #[must_use]
    pub fn is_basic(&self, products: &ProductCatalog) -> bool {
        self.is_entitlement_active
            && products.tier_of(&self.subscription_id) == Some(ContentTier::Basic)
    }

    /// Returns `true` if this record grants the premium content tier.
    #[must_use]
    pub fn is_premium(&self, products: &ProductCatalog) -> bool {
        self.is_entitlement_active
            && products.tier_of(&self.subscription_id) == Some(ContentTier::Premium)
    }

    /// Returns `true` when the user must fix their payment method.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        self.is_grace_period || self.is_account_hold
    }

    /// Returns `true` when the record says the purchase belongs elsewhere.
    #[must_use]
    pub fn is_owned_elsewhere(&self, account: &AccountId) -> bool {
        self.sub_already_owned || self.account_id.as_ref().is_some_and(|owner| owner != account)
    }
}

/// Subscription records for one account, as returned by the backend.
///
/// On the wire this is `{"subscriptions": [...]}`; a missing or `null`
/// list decodes as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStatusList {
    /// Records in server order.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub subscriptions: Vec<SubscriptionStatus>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<SubscriptionStatus>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<SubscriptionStatus>>::deserialize(deserializer)?.unwrap_or_default())
}

impl SubscriptionStatusList {
    /// Wraps records in a list.
    #[must_use]
    pub fn new(subscriptions: Vec<SubscriptionStatus>) -> Self {
        Self { subscriptions }
    }

    /// Number of records, duplicates included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns `true` if the server reported no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Iterates records in server order.
    pub fn iter(&self) -> std::slice::Iter<'_, SubscriptionStatus> {
        self.subscriptions.iter()
    }

    /// Finds the record for a purchase token.
    #[must_use]
    pub fn find_by_token(&self, token: &PurchaseToken) -> Option<&SubscriptionStatus> {
        self.subscriptions.iter().find(|s| &s.purchase_token == token)
    }
}

impl IntoIterator for SubscriptionStatusList {
    type IntoIter = std::vec::IntoIter<SubscriptionStatus>;
    type Item = SubscriptionStatus;

    fn into_iter(self) -> Self::IntoIter {
        self.subscriptions.into_iter()
    }
}

/// Purchase observed by the billing collaborator.
///
/// Ephemeral: the core never persists purchase events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseEvent {
    /// Purchased product.
    pub sku: SubscriptionId,
    /// Token identifying this purchase.
    pub purchase_token: PurchaseToken,
    /// Whether the purchase has been acknowledged with the billing platform.
    pub acknowledged: bool,
}

impl PurchaseEvent {
    /// Creates a purchase event from raw billing values.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidInput`] if the sku or token is invalid.
    pub fn new(sku: &str, purchase_token: &str, acknowledged: bool) -> Result<Self> {
        Ok(Self {
            sku: SubscriptionId::new(sku)?,
            purchase_token: PurchaseToken::new(purchase_token)?,
            acknowledged,
        })
    }
}

/// Push-notification routing registration for one app install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRegistration {
    /// Device/app-install identifier.
    pub instance_id: String,
    /// Account the install is registered for.
    pub account_id: AccountId,
}

/// Credential of the signed-in account.
///
/// The token is sent as a bearer token and is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountCredential {
    account_id: AccountId,
    token: String,
}

impl AccountCredential {
    /// Creates a credential.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidInput`] if the token is empty or contains
    /// characters that cannot appear in an HTTP header.
    pub fn new<S: Into<String>>(account_id: AccountId, token: S) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(SyncError::InvalidInput("credential token cannot be empty".to_owned()));
        }
        if token.chars().any(|c| c.is_control() || c == ' ') {
            return Err(SyncError::InvalidInput(
                "credential token contains invalid characters".to_owned(),
            ));
        }
        Ok(Self { account_id, token })
    }

    /// Account this credential authenticates.
    #[must_use]
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Raw bearer token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredential")
            .field("account_id", &self.account_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Location of a piece of gated content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentResource {
    /// Content URL.
    pub url: String,
}

/// Opaque acknowledgement returned by instance-id calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack(pub String);

/// Content tier unlocked by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentTier {
    /// Basic rides.
    Basic,
    /// Premium rides.
    Premium,
}

/// Maps product ids to content tiers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProductCatalog {
    /// Product id of the basic subscription.
    #[serde(default = "default_basic")]
    pub basic: SubscriptionId,
    /// Product id of the premium subscription.
    #[serde(default = "default_premium")]
    pub premium: SubscriptionId,
}

fn default_basic() -> SubscriptionId {
    SubscriptionId("basic_subscription".to_owned())
}

fn default_premium() -> SubscriptionId {
    SubscriptionId("premium_subscription".to_owned())
}

impl Default for ProductCatalog {
    fn default() -> Self {
        Self { basic: default_basic(), premium: default_premium() }
    }
}

impl ProductCatalog {
    /// Returns the tier a product unlocks, if any.
    #[must_use]
    pub fn tier_of(&self, id: &SubscriptionId) -> Option<ContentTier> {
        if id == &self.premium {
            Some(ContentTier::Premium)
        } else if id == &self.basic {
            Some(ContentTier::Basic)
        } else {
            None
        }
    }
}
