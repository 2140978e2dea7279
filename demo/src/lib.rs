use chrono::{DateTime, Duration, Utc};
use flujo::{
    Event, EventRecord, SubscriptionFilter, Uniqueness, Workflow, WorkflowContext, WorkflowError,
    WorkflowFactory, WorkflowId,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderContext {
    pub order_no: String,
    pub region: String,
    pub fulfilled: bool,
    pub rounds: u32,
}

/// Waits for an order event from its region, fulfills it, completes.
pub struct OrderFulfilmentWorkflow {
    workflow_id: WorkflowId,
    context: OrderContext,
    scheduled_at: DateTime<Utc>,
    finished: bool,
    error_count: i32,
}

impl OrderFulfilmentWorkflow {
    pub fn new(order_no: &str, region: &str) -> Self {
        Self {
            workflow_id: 0,
            context: OrderContext {
                order_no: order_no.to_string(),
                region: region.to_string(),
                fulfilled: false,
                rounds: 0,
            },
            scheduled_at: Utc::now(),
            finished: false,
            error_count: 0,
        }
    }
}

impl Workflow for OrderFulfilmentWorkflow {
    fn id(&self) -> WorkflowId {
        self.workflow_id
    }

    fn set_id(&mut self, workflow_id: WorkflowId) {
        self.workflow_id = workflow_id;
    }

    fn workflow_type(&self) -> &str {
        "order_fulfilment"
    }

    fn context(&self) -> WorkflowContext {
        serde_json::to_value(&self.context).unwrap_or_else(|_| json!({}))
    }

    fn set_context(&mut self, context: WorkflowContext) {
        // A context this type cannot read is left as constructed.
        if let Ok(parsed) = serde_json::from_value(context) {
            self.context = parsed;
        }
    }

    fn set_error_count(&mut self, error_count: i32) {
        self.error_count = error_count;
    }

    fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    fn run(&mut self, events: &[EventRecord]) -> Result<(), WorkflowError> {
        self.context.rounds += 1;
        if events.iter().any(|e| e.event_type == "order") {
            self.context.fulfilled = true;
            self.mark_finished();
        } else {
            // Nothing happened yet; check back later in case routing dries up.
            self.scheduled_at = Utc::now() + Duration::hours(12);
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn mark_finished(&mut self) {
        self.finished = true;
    }

    fn exceeded_error_budget(&self) -> bool {
        self.error_count > 5
    }

    fn is_erroring(&self) -> bool {
        false
    }

    fn subscriptions(&self) -> Vec<SubscriptionFilter> {
        vec![SubscriptionFilter::new(
            "order",
            "region",
            vec![self.context.region.clone()],
        )]
    }

    fn uniqueness(&self) -> Option<Uniqueness> {
        Some(Uniqueness::new("order_no", &self.context.order_no))
    }
}

pub struct OrderFulfilmentWorkflowFactory;

impl WorkflowFactory for OrderFulfilmentWorkflowFactory {
    fn create(&self) -> Box<dyn Workflow> {
        Box::new(OrderFulfilmentWorkflow::new("", ""))
    }

    fn workflow_type(&self) -> &str {
        "order_fulfilment"
    }
}

/// An order occurrence with its region as the routed context pair.
pub struct OrderEvent {
    pub order_no: String,
    pub region: String,
}

impl OrderEvent {
    pub fn new(order_no: &str, region: &str) -> Self {
        Self {
            order_no: order_no.to_string(),
            region: region.to_string(),
        }
    }
}

impl Event for OrderEvent {
    fn event_type(&self) -> &str {
        "order"
    }

    fn context(&self) -> serde_json::Value {
        json!({"order_no": self.order_no, "region": self.region})
    }

    fn routing_pairs(&self) -> Vec<(String, String)> {
        vec![("region".to_string(), self.region.clone())]
    }

    fn identity(&self) -> String {
        format!("order-{}", self.order_no)
    }
}
