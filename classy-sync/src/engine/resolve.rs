//! Duplicate subscription-id resolution for server responses.
//!
//! A response should hold at most one record per subscription id. When it
//! does not, one record is kept:
//!
//! 1. the only record with an active entitlement, if exactly one is active;
//! 2. otherwise, among the active records (or all records when none is
//!    active), the one whose token matches the last purchase observed
//!    locally for that id;
//! 3. otherwise the last of those candidates in response order.
//!
//! Cases 2 and 3 are reported as [`Ambiguity`] so the engine can surface them.

use std::collections::{BTreeMap, HashMap};

use crate::{
    models::{PurchaseToken, SubscriptionId, SubscriptionStatus},
    store::StoredRecords,
};

/// A subscription id that needed the tie-break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Ambiguity {
    pub subscription_id: SubscriptionId,
    pub candidates: usize,
    pub chosen: PurchaseToken,
}

/// Records keyed by id after resolution.
#[derive(Debug, Default)]
pub(crate) struct Resolved {
    pub records: StoredRecords,
    pub ambiguities: Vec<Ambiguity>,
}

pub(crate) fn resolve_duplicates(
    response: Vec<SubscriptionStatus>,
    last_purchase: &HashMap<SubscriptionId, PurchaseToken>,
) -> Resolved {
    let mut groups: BTreeMap<SubscriptionId, Vec<SubscriptionStatus>> = BTreeMap::new();
    for record in response {
        groups.entry(record.subscription_id.clone()).or_default().push(record);
    }

    let mut resolved = Resolved::default();
    for (id, mut group) in groups {
        let total = group.len();
        let chosen = if total == 1 {
            group.pop()
        } else {
            let active = group.iter().filter(|r| r.is_entitlement_active).count();
            if active == 1 {
                group.into_iter().find(|r| r.is_entitlement_active)
            } else {
                if active > 1 {
                    group.retain(|r| r.is_entitlement_active);
                }
                let preferred = last_purchase.get(&id);
                let index = preferred
                    .and_then(|token| group.iter().rposition(|r| &r.purchase_token == token))
                    .unwrap_or(group.len() - 1);
                let record = group.swap_remove(index);
                resolved.ambiguities.push(Ambiguity {
                    subscription_id: id.clone(),
                    candidates: total,
                    chosen: record.purchase_token.clone(),
                });
                Some(record)
            }
        };
        if let Some(record) = chosen {
            resolved.records.insert(id, record);
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PurchaseEvent;

    fn record(sku: &str, token: &str, active: bool) -> SubscriptionStatus {
        let event = PurchaseEvent::new(sku, token, true).unwrap();
        let mut status = SubscriptionStatus::for_purchase(&event);
        status.is_entitlement_active = active;
        status
    }

    fn id(value: &str) -> SubscriptionId {
        SubscriptionId::new(value).unwrap()
    }

    #[test]
    fn test_unique_ids_pass_through() {
        let resolved = resolve_duplicates(
            vec![record("basic", "t1", true), record("premium", "t2", false)],
            &HashMap::new(),
        );
        assert_eq!(resolved.records.len(), 2);
        assert!(resolved.ambiguities.is_empty());
    }

    #[test]
    fn test_single_active_record_wins() {
        let resolved = resolve_duplicates(
            vec![record("basic", "old", false), record("basic", "new", true), record("basic", "x", false)],
            &HashMap::new(),
        );
        assert_eq!(resolved.records[&id("basic")].purchase_token.as_str(), "new");
        assert!(resolved.ambiguities.is_empty());
    }

    #[test]
    fn test_no_active_prefers_last_local_purchase() {
        let mut last = HashMap::new();
        last.insert(id("basic"), PurchaseToken::new("a").unwrap());

        let resolved = resolve_duplicates(
            vec![record("basic", "a", false), record("basic", "b", false)],
            &last,
        );
        assert_eq!(resolved.records[&id("basic")].purchase_token.as_str(), "a");
        assert_eq!(
            resolved.ambiguities,
            vec![Ambiguity {
                subscription_id: id("basic"),
                candidates: 2,
                chosen: PurchaseToken::new("a").unwrap()
            }]
        );
    }

    #[test]
    fn test_no_local_purchase_takes_last_in_order() {
        let resolved = resolve_duplicates(
            vec![record("basic", "a", false), record("basic", "b", false)],
            &HashMap::new(),
        );
        assert_eq!(resolved.records[&id("basic")].purchase_token.as_str(), "b");
        assert_eq!(resolved.ambiguities.len(), 1);
    }

    #[test]
    fn test_several_active_only_considers_active() {
        let mut last = HashMap::new();
        last.insert(id("basic"), PurchaseToken::new("inactive").unwrap());

        let resolved = resolve_duplicates(
            vec![record("basic", "a", true), record("basic", "inactive", false), record("basic", "c", true)],
            &last,
        );
        // The preferred token is inactive, so the last active record wins.
        assert_eq!(resolved.records[&id("basic")].purchase_token.as_str(), "c");
        assert_eq!(resolved.ambiguities[0].candidates, 3);
    }
}
