pub const FLAG_CACHE_HIT_COUNTER: &str = "flag_cache_hit_total";
pub const FLAG_CACHE_MISS_COUNTER: &str = "flag_cache_miss_total";
pub const FLAG_CACHE_STALE_HIT_COUNTER: &str = "flag_cache_stale_hit_total";
pub const FLAG_CACHE_REPLACE_COUNTER: &str = "flag_cache_replace_total";
pub const STORAGE_CORRUPTION_RESET_COUNTER: &str = "flag_cache_storage_corruption_reset_total";
pub const STORAGE_WRITE_ERROR_COUNTER: &str = "flag_cache_storage_write_error_total";
pub const APPLY_RECORDED_COUNTER: &str = "apply_events_recorded_total";
pub const APPLY_DEDUPLICATED_COUNTER: &str = "apply_events_deduplicated_total";
pub const APPLY_DELIVERED_COUNTER: &str = "apply_events_delivered_total";
pub const APPLY_REJECTED_COUNTER: &str = "apply_events_rejected_total";
pub const APPLY_RETRIED_COUNTER: &str = "apply_events_retried_total";
pub const APPLY_DELIVERY_DURATION_HISTOGRAM: &str = "apply_events_delivery_duration_seconds";
