diesel::table! {
    inventory (id) {
        id -> Int4,
        name -> Varchar,
        description -> Nullable<Text>,
        quantity -> Nullable<Int4>,
        category -> Nullable<Varchar>,
        location -> Nullable<Varchar>,
        inventory_item_id -> Nullable<Int8>,
        location_id -> Nullable<Int8>,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    inventory_levels (inventory_item_id) {
        inventory_item_id -> Int8,
        location_id -> Int8,
        available -> Int4,
        platform_updated_at -> Nullable<Timestamptz>,
        last_synced_at -> Nullable<Timestamptz>,
        sync_status -> Varchar,
        source_of_truth -> Varchar,
    }
}

diesel::table! {
    inventory_movements (id) {
        id -> Uuid,
        inventory_item_id -> Int8,
        location_id -> Nullable<Int8>,
        previous_available -> Nullable<Int4>,
        new_available -> Int4,
        delta -> Int4,
        source -> Varchar,
        occurred_at -> Timestamptz,
    }
}

diesel::table! {
    locations (id) {
        id -> Int8,
        name -> Nullable<Text>,
        address1 -> Nullable<Text>,
        address2 -> Nullable<Text>,
        city -> Nullable<Text>,
        province -> Nullable<Text>,
        country -> Nullable<Text>,
        zip -> Nullable<Text>,
        last_synced_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    outbox_jobs (id) {
        id -> Uuid,
        job_type -> Varchar,
        idempotency_key -> Nullable<Varchar>,
        payload -> Jsonb,
        status -> Varchar,
        attempts -> Int4,
        last_error -> Nullable<Text>,
        run_after -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    products (id) {
        id -> Int8,
        title -> Nullable<Text>,
        handle -> Nullable<Text>,
        platform_created_at -> Nullable<Timestamptz>,
        platform_updated_at -> Nullable<Timestamptz>,
        local_updated_at -> Nullable<Timestamptz>,
        last_synced_at -> Nullable<Timestamptz>,
        sync_status -> Varchar,
        source_of_truth -> Varchar,
    }
}

diesel::table! {
    webhook_events (id) {
        id -> Uuid,
        topic -> Varchar,
        shop_domain -> Nullable<Varchar>,
        webhook_id -> Nullable<Varchar>,
        payload -> Jsonb,
        received_at -> Timestamptz,
        claimed_at -> Nullable<Timestamptz>,
        processed_at -> Nullable<Timestamptz>,
        last_error -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    inventory,
    inventory_levels,
    inventory_movements,
    locations,
    outbox_jobs,
    products,
    webhook_events,
);
