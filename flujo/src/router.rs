use crate::state::State;
use crate::{Event, StoreResult, WorkflowId, UNIQUENESS_EVENT_TYPE, WILDCARD};
use chrono::{DateTime, Utc};

/// Most workflows an event occurrence may wake through one tested pair.
const FAN_OUT_CAP: i64 = 1000;

/// Delivers event occurrences to subscribed workflows.
///
/// Matching and insertion happen in one set-based statement per tested pair,
/// so concurrent subscription changes cannot split an occurrence in half.
pub struct EventRouter {
    state: State,
}

impl EventRouter {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    /// Routes one occurrence and returns how many workflows were woken.
    ///
    /// Every (key, value) pair the event carries is tested in order; each
    /// workflow receives at most one event row per occurrence no matter how
    /// many of its subscriptions match. An occurrence matching nothing leaves
    /// exactly one NO_SUBSCRIBERS sentinel row behind.
    pub fn route(&self, event: &dyn Event, now: DateTime<Utc>) -> StoreResult<u64> {
        if event.event_type() == UNIQUENESS_EVENT_TYPE {
            log::warn!(
                "refusing to route the reserved uniqueness event type. identity={:?}",
                event.identity()
            );
            return Ok(0);
        }
        let mut pairs = event.routing_pairs();
        if pairs.is_empty() {
            pairs.push((WILDCARD.to_string(), WILDCARD.to_string()));
        }
        let context = event.context();
        let mut matched: Vec<WorkflowId> = Vec::new();
        for (context_key, context_value) in &pairs {
            let newly = match self.state.store.fan_out_event(
                event.event_type(),
                &context,
                context_key,
                context_value,
                &matched,
                FAN_OUT_CAP,
                now,
            ) {
                Ok(newly) => newly,
                Err(err) => {
                    log::error!(
                        "event fan-out failed. event_type={:?} identity={:?} key={:?} error={:?}",
                        event.event_type(),
                        event.identity(),
                        context_key,
                        err
                    );
                    return Err(err);
                }
            };
            matched.extend(newly);
        }
        if matched.is_empty() {
            self.state
                .store
                .insert_fallback_event(event.event_type(), &context, now)?;
            log::info!(
                "event matched no subscriptions. event_type={:?} identity={:?}",
                event.event_type(),
                event.identity()
            );
        } else {
            log::debug!(
                "event routed. event_type={:?} identity={:?} woken={:?}",
                event.event_type(),
                event.identity(),
                matched.len()
            );
        }
        Ok(matched.len() as u64)
    }
}
