use crate::state::{NewSubscriptionRecord, State};
use crate::{StoreResult, SubscriptionFilter, Uniqueness, WorkflowId, UNIQUENESS_EVENT_TYPE, WILDCARD};

/// Expands workflow-declared filters into subscription rows and keeps the
/// index idempotent under re-registration.
pub struct SubscriptionIndex {
    state: State,
}

impl SubscriptionIndex {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    /// Expands filters into concrete rows: one row per declared value, or the
    /// wildcard pair when a filter declares none. Duplicate tuples collapse.
    pub fn expand(
        workflow_id: WorkflowId,
        filters: &[SubscriptionFilter],
    ) -> Vec<NewSubscriptionRecord> {
        let mut rows: Vec<NewSubscriptionRecord> = Vec::new();
        for filter in filters {
            let pairs: Vec<(String, String)> = if filter.context_values.is_empty() {
                vec![(WILDCARD.to_string(), WILDCARD.to_string())]
            } else {
                filter
                    .context_values
                    .iter()
                    .map(|value| (filter.context_key.clone(), value.clone()))
                    .collect()
            };
            for (context_key, context_value) in pairs {
                let row = NewSubscriptionRecord {
                    workflow_id,
                    event_type: filter.event_type.clone(),
                    context_key,
                    context_value,
                };
                if !rows.contains(&row) {
                    rows.push(row);
                }
            }
        }
        rows
    }

    /// The fingerprint row backing a uniqueness constraint. It lives in the
    /// same table as routing subscriptions under a reserved event type, so it
    /// retires together with them.
    pub fn uniqueness_row(workflow_id: WorkflowId, uniqueness: &Uniqueness) -> NewSubscriptionRecord {
        NewSubscriptionRecord {
            workflow_id,
            event_type: UNIQUENESS_EVENT_TYPE.to_string(),
            context_key: uniqueness.key.clone(),
            context_value: uniqueness.value.clone(),
        }
    }

    /// Registers a workflow's filters, skipping tuples that already exist.
    /// Returns how many rows were actually written.
    pub fn register(
        &self,
        workflow_id: WorkflowId,
        filters: &[SubscriptionFilter],
    ) -> StoreResult<u64> {
        let mut inserted = 0;
        for row in Self::expand(workflow_id, filters) {
            if self.state.store.insert_subscription_if_absent(row)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub fn uniqueness_exists(&self, uniqueness: &Uniqueness) -> StoreResult<bool> {
        self.state
            .store
            .uniqueness_exists(&uniqueness.key, &uniqueness.value)
    }

    /// Retires every ACTIVE subscription of a workflow, fingerprints included.
    pub fn retire_all(&self, workflow_id: WorkflowId) -> StoreResult<u64> {
        self.state.store.retire_subscriptions(workflow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::create_test_state;

    #[test]
    fn test_expand_values_wildcard_and_dedupe() {
        let filters = vec![
            SubscriptionFilter::new("order", "region", vec!["EU".to_string(), "US".to_string()]),
            SubscriptionFilter::wildcard("shipment"),
            SubscriptionFilter::new("order", "region", vec!["EU".to_string()]),
        ];
        let rows = SubscriptionIndex::expand(7, &filters);
        assert_eq!(3, rows.len());
        assert_eq!(("order", "region", "EU"), row_tuple(&rows[0]));
        assert_eq!(("order", "region", "US"), row_tuple(&rows[1]));
        assert_eq!(("shipment", "", ""), row_tuple(&rows[2]));
        assert!(rows.iter().all(|row| row.workflow_id == 7));
    }

    fn row_tuple(row: &NewSubscriptionRecord) -> (&str, &str, &str) {
        (&row.event_type, &row.context_key, &row.context_value)
    }

    #[test]
    fn test_register_is_idempotent() {
        let state = create_test_state();
        let index = SubscriptionIndex::new(state.clone());
        let filters = vec![SubscriptionFilter::new(
            "order",
            "region",
            vec!["EU".to_string()],
        )];
        assert_eq!(1, index.register(7, &filters).unwrap());
        assert_eq!(0, index.register(7, &filters).unwrap());
        // Exactly one row exists to retire.
        assert_eq!(1, index.retire_all(7).unwrap());
    }

    #[test]
    fn test_uniqueness_lifecycle() {
        let state = create_test_state();
        let index = SubscriptionIndex::new(state.clone());
        let uniqueness = Uniqueness::new("customer", "42");
        assert!(!index.uniqueness_exists(&uniqueness).unwrap());
        let row = SubscriptionIndex::uniqueness_row(7, &uniqueness);
        state.store.insert_subscription_if_absent(row).unwrap();
        assert!(index.uniqueness_exists(&uniqueness).unwrap());
        // Retiring the workflow's subscriptions frees the fingerprint.
        assert_eq!(1, index.retire_all(7).unwrap());
        assert!(!index.uniqueness_exists(&uniqueness).unwrap());
    }
}
