// planttexts schema - plant care tables for Diesel ORM

diesel::table! {
    schema_versions (id) {
        id -> Integer,
        version -> Text,
        name -> Text,
        features -> Text,
        introduced_at -> Text,
    }
}

// ============================================================================
// Reference Data
// ============================================================================

diesel::table! {
    plants_catalog (id) {
        id -> Integer,
        name -> Text,
        species -> Text,
        category -> Text,
        care_requirements -> Text,       // JSON, see catalog::CareRequirements
        difficulty_level -> Text,        // easy, medium, hard
        description -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    personality_types (id) {
        id -> Integer,
        name -> Text,
        description -> Text,
        prompt_template -> Text,
        voice_traits -> Text,            // JSON
        created_at -> Text,
    }
}

diesel::table! {
    seed_runs (id) {
        id -> Integer,
        source -> Text,
        content_hash -> Text,
        entries -> Integer,
        seeded_at -> Text,
    }
}

// ============================================================================
// Users and Their Plants
// ============================================================================

diesel::table! {
    users (id) {
        id -> Integer,
        phone -> Text,
        email -> Nullable<Text>,
        subscription_tier -> Text,
        timezone -> Text,
        location -> Nullable<Text>,
        is_active -> Bool,
        created_at -> Text,
        deleted_at -> Nullable<Text>,
        phone_verified -> Bool,
        verified_at -> Nullable<Text>,
    }
}

diesel::table! {
    user_plants (id) {
        id -> Integer,
        user_id -> Integer,
        plant_catalog_id -> Integer,
        personality_type_id -> Integer,
        nickname -> Text,
        is_active -> Bool,
        last_watered -> Nullable<Text>,
        last_fertilized -> Nullable<Text>,
        created_at -> Text,
        removed_at -> Nullable<Text>,
    }
}

// ============================================================================
// Care Schedules and Ledger
// ============================================================================

diesel::table! {
    care_schedules (id) {
        id -> Integer,
        user_plant_id -> Integer,
        task_type -> Text,
        frequency_days -> Integer,
        next_due -> Text,
        last_reminded_at -> Nullable<Text>,
        is_active -> Bool,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    care_history (id) {
        id -> Integer,
        user_plant_id -> Integer,
        task_type -> Text,
        completed_at -> Text,
        method -> Text,                  // manual, sms, api
        notes -> Nullable<Text>,
        created_at -> Text,
    }
}

// ============================================================================
// Conversation and SMS Traffic
// ============================================================================

diesel::table! {
    conversation_messages (id) {
        id -> Integer,
        user_plant_id -> Integer,
        role -> Text,                    // user, plant, reminder
        content -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    sms_log (id) {
        id -> Integer,
        direction -> Text,               // inbound, outbound
        phone -> Text,
        body -> Text,
        status -> Text,                  // received, sent, logged, failed
        provider -> Nullable<Text>,
        provider_message_id -> Nullable<Text>,
        error -> Nullable<Text>,
        created_at -> Text,
    }
}
