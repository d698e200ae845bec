use super::*;

#[test]
fn env_parse_missing_returns_default() {
    let val: usize = env_parse("__TABLE_TEST_NONEXISTENT_KEY__", 42);
    assert_eq!(val, 42);
}

#[test]
fn env_parse_present_valid() {
    unsafe { std::env::set_var("__TABLE_TEST_EP_VALID__", "99") };
    let val: u64 = env_parse("__TABLE_TEST_EP_VALID__", 0);
    assert_eq!(val, 99);
    unsafe { std::env::remove_var("__TABLE_TEST_EP_VALID__") };
}

#[test]
fn env_parse_present_invalid_returns_default() {
    unsafe { std::env::set_var("__TABLE_TEST_EP_INVALID__", "notanumber") };
    let val: usize = env_parse("__TABLE_TEST_EP_INVALID__", 7);
    assert_eq!(val, 7);
    unsafe { std::env::remove_var("__TABLE_TEST_EP_INVALID__") };
}

#[test]
fn env_parse_bool() {
    unsafe { std::env::set_var("__TABLE_TEST_EP_BOOL__", "false") };
    assert!(!env_parse("__TABLE_TEST_EP_BOOL__", true));
    unsafe { std::env::remove_var("__TABLE_TEST_EP_BOOL__") };
}

#[test]
fn zero_timer_period_is_raised_to_one_millisecond() {
    unsafe { std::env::set_var("__TABLE_TEST_PERIOD_ZERO__", "0") };
    assert_eq!(env_period("__TABLE_TEST_PERIOD_ZERO__", 5000), Duration::from_millis(1));
    unsafe { std::env::remove_var("__TABLE_TEST_PERIOD_ZERO__") };
    assert_eq!(env_period("__TABLE_TEST_PERIOD_ZERO__", 5000), Duration::from_millis(5000));
}

#[test]
fn quality_levels_are_ascending() {
    for pair in QUALITY_LEVELS.windows(2) {
        assert!(pair[0].emote_rate_limit.0 <= pair[1].emote_rate_limit.0);
    }
}

#[test]
fn max_global_quality_includes_additional_levels() {
    let quality = QualityConfig::default();
    assert_eq!(quality.max_global(), QUALITY_LEVELS.len() + 1);
}

#[test]
fn quality_level_serializes_with_client_field_names() {
    let json = serde_json::to_value(QUALITY_LEVELS[2]).unwrap();
    assert_eq!(json["mouseUpdateCoolDown"], 500);
    assert_eq!(json["emotesCoolDown"], serde_json::json!([3, 10000]));
}

#[test]
fn defaults_match_constants() {
    let config = ServerConfig::default();
    assert_eq!(config.port, DEFAULT_PORT);
    assert_eq!(config.ping_allowed_failures, DEFAULT_PING_ALLOWED_FAILURES);
    assert_eq!(config.limits.army_bases, DEFAULT_ARMY_BASES_LIMIT);
    assert_eq!(config.table_removal_delay, Duration::from_secs(3600));
}
