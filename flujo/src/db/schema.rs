diesel::table! {
    workflows (workflow_id) {
        workflow_id -> BigInt,
        #[sql_name = "type"]
        workflow_type -> Text,
        context -> Jsonb,
        scheduled_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        finished_at -> Nullable<Timestamptz>,
        status -> Text,
        lock -> Text,
        error_count -> Int4,
    }
}

diesel::table! {
    events (event_id) {
        event_id -> BigInt,
        #[sql_name = "type"]
        event_type -> Text,
        context -> Jsonb,
        status -> Text,
        workflow_id -> BigInt,
        created_at -> Timestamptz,
        finished_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    subscriptions (subscription_id) {
        subscription_id -> BigInt,
        workflow_id -> BigInt,
        status -> Text,
        event_type -> Text,
        context_key -> Text,
        context_value -> Text,
    }
}

diesel::table! {
    hosts (hostname) {
        hostname -> Text,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    execution_log (log_id) {
        log_id -> BigInt,
        workflow_id -> BigInt,
        log_text -> Text,
        pid -> Int4,
        host -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    workflows,
    events,
    subscriptions,
    hosts,
    execution_log,
);
