//! Diesel table definitions matching the embedded migrations.

diesel::table! {
    employees (id) {
        id -> BigInt,
        stable_id -> Text,
        name -> Nullable<Text>,
        nip -> Nullable<Text>,
        email -> Nullable<Text>,
        phone -> Nullable<Text>,
        position -> Nullable<Text>,
        department -> Nullable<Text>,
        status -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    kv_store (key) {
        key -> Text,
        value -> Text,
        expires_at -> Nullable<BigInt>,
        updated_at -> Text,
    }
}

diesel::table! {
    notification_jobs (id) {
        id -> Text,
        recipient_kind -> Text,
        recipient_id -> Text,
        title -> Text,
        body -> Text,
        kind -> Text,
        action -> Nullable<Text>,
        payload -> Text,
        channel_token -> Nullable<Text>,
        priority -> Text,
        status -> Text,
        message_id -> Nullable<Text>,
        error -> Nullable<Text>,
        created_at -> Text,
        sent_at -> Nullable<Text>,
        read_at -> Nullable<Text>,
        scheduled_at -> Nullable<Text>,
    }
}

diesel::table! {
    permits (id) {
        id -> BigInt,
        stable_id -> Text,
        employee_stable_id -> Nullable<Text>,
        permit_type -> Nullable<Text>,
        start_date -> Nullable<Text>,
        end_date -> Nullable<Text>,
        reason -> Nullable<Text>,
        status -> Nullable<Text>,
        submitted_at -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    presences (id) {
        id -> BigInt,
        stable_id -> Text,
        employee_stable_id -> Nullable<Text>,
        presence_date -> Nullable<Text>,
        check_in -> Nullable<Text>,
        check_out -> Nullable<Text>,
        status -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sync_outbox (event_id) {
        event_id -> Text,
        domain -> Text,
        stable_id -> Text,
        op -> Text,
        payload -> Text,
        status -> Text,
        created_at -> Text,
        sent_at -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    employees,
    kv_store,
    notification_jobs,
    permits,
    presences,
    sync_outbox,
);
