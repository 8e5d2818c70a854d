diesel::table! {
    webhook_subscriptions (id) {
        id -> Uuid,
        tenant_id -> Varchar,
        callback_url -> Varchar,
        events -> Array<Text>,
        headers -> Jsonb,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    webhook_failures (id) {
        id -> Uuid,
        subscription_id -> Uuid,
        event -> Varchar,
        callback_url -> Varchar,
        error -> Text,
        payload -> Jsonb,
        recorded_at -> Timestamptz,
    }
}
