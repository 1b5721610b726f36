use lazy_static::lazy_static;

lazy_static! {
    pub static ref KEEP_NUM_KEYGENS_COMPLETED: prometheus::IntCounter =
        prometheus::register_int_counter!(
            "keep_node_num_keygens_completed",
            "Number of key generations this operator completed and persisted"
        )
        .unwrap();
}

lazy_static! {
    pub static ref KEEP_NUM_KEYGENS_FAILED: prometheus::IntCounter =
        prometheus::register_int_counter!(
            "keep_node_num_keygens_failed",
            "Number of key generations that ended without a persisted share"
        )
        .unwrap();
}

lazy_static! {
    pub static ref KEEP_KEYGEN_TIME_MS: prometheus::IntGauge = prometheus::register_int_gauge!(
        "keep_node_keygen_time_ms",
        "Time taken by the most recent key generation"
    )
    .unwrap();
}

lazy_static! {
    pub static ref KEEP_NUM_SIGNATURES_GENERATED: prometheus::IntCounter =
        prometheus::register_int_counter!(
            "keep_node_num_signatures_generated",
            "Number of signatures computed, whether or not this operator submitted them"
        )
        .unwrap();
}

lazy_static! {
    pub static ref KEEP_NUM_SIGNATURES_SUBMITTED: prometheus::IntCounter =
        prometheus::register_int_counter!(
            "keep_node_num_signatures_submitted",
            "Number of signatures this operator submitted on chain"
        )
        .unwrap();
}

lazy_static! {
    pub static ref KEEP_SIGNATURE_TIME_MS: prometheus::IntGauge = prometheus::register_int_gauge!(
        "keep_node_signature_time_ms",
        "Time taken by the most recent signing protocol"
    )
    .unwrap();
}

lazy_static! {
    pub static ref KEEP_EVENTS_REJECTED: prometheus::IntCounterVec =
        prometheus::register_int_counter_vec!(
            "keep_node_events_rejected",
            "Number of chain events dropped by the deduplicator",
            &["track"],
        )
        .unwrap();
}

lazy_static! {
    pub static ref KEEP_ACTIVE_KEEPS: prometheus::IntGauge = prometheus::register_int_gauge!(
        "keep_node_active_keeps",
        "Number of keeps this operator currently holds a share for"
    )
    .unwrap();
}

lazy_static! {
    pub static ref KEEP_KEEPS_ARCHIVED: prometheus::IntCounter =
        prometheus::register_int_counter!(
            "keep_node_keeps_archived",
            "Number of keeps whose shares were moved to the archive"
        )
        .unwrap();
}

lazy_static! {
    pub static ref KEEP_PRE_PARAMS_AVAILABLE: prometheus::IntGauge =
        prometheus::register_int_gauge!(
            "keep_node_pre_params_available",
            "Number of pre-parameters waiting in the pool"
        )
        .unwrap();
}

lazy_static! {
    pub static ref KEEP_PRE_PARAMS_POOL_MISSES: prometheus::IntCounter =
        prometheus::register_int_counter!(
            "keep_node_pre_params_pool_misses",
            "Number of key generations that found the pre-parameter pool empty"
        )
        .unwrap();
}

lazy_static! {
    pub static ref KEEP_OPERATOR_BALANCE_BELOW_THRESHOLD: prometheus::IntGauge =
        prometheus::register_int_gauge!(
            "keep_node_operator_balance_below_threshold",
            "1 if the last sampled operator balance was below the alert threshold"
        )
        .unwrap();
}

lazy_static! {
    pub static ref KEEP_OPERATOR_BALANCE: prometheus::Gauge = prometheus::register_gauge!(
        "keep_node_operator_balance",
        "Last sampled balance of the operator account, in base units"
    )
    .unwrap();
}

lazy_static! {
    pub static ref KEEP_TX_RESUBMISSIONS: prometheus::IntCounter =
        prometheus::register_int_counter!(
            "keep_node_tx_resubmissions",
            "Number of transactions re-broadcast with a raised gas price"
        )
        .unwrap();
}

lazy_static! {
    pub static ref KEEP_LATEST_NONCE: prometheus::IntGauge = prometheus::register_int_gauge!(
        "keep_node_latest_nonce",
        "Latest nonce used by this operator's account",
    )
    .unwrap();
}

lazy_static! {
    pub static ref KEEP_FIREWALL_DECISIONS: prometheus::IntCounterVec =
        prometheus::register_int_counter_vec!(
            "keep_node_firewall_decisions",
            "Inbound peer admission decisions by reason",
            &["decision"],
        )
        .unwrap();
}

lazy_static! {
    pub static ref NETWORK_LIVE_CONNECTIONS: prometheus::IntGaugeVec =
        prometheus::register_int_gauge_vec!(
            "keep_node_network_live_connections",
            "Live connections between this operator and a peer",
            &["my_operator", "peer_operator"],
        )
        .unwrap();
}
