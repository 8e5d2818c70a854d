diesel::table! {
    orders (id) {
        id -> Uuid,
        tenant_id -> Varchar,
        seller_id -> Varchar,
        hub_id -> Varchar,
        sku_id -> Varchar,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
