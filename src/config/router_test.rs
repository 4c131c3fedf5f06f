use super::*;

#[test]
fn default_router_config_should_pass_validation() {
    assert!(RouterConfig::default().validate().is_ok());
}

#[test]
fn retry_max_ttl_should_be_at_least_one() {
    let config = RouterConfig {
        retry_max_ttl: 0,
        ..Default::default()
    };

    assert_eq!(config.retry_max_ttl(), 1);
}

#[test]
fn batch_counts_should_be_at_least_one() {
    let config = RouterConfig {
        pending_action_batch_count: 0,
        closing_action_batch_count: 0,
        ..Default::default()
    };

    assert_eq!(config.pending_action_batch_count(), 1);
    assert_eq!(config.closing_action_batch_count(), 1);
}

#[test]
fn validation_should_reject_non_positive_intervals() {
    let config = RouterConfig {
        default_timer_interval: 0,
        ..Default::default()
    };

    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_fast_timer_slower_than_default() {
    let config = RouterConfig {
        default_timer_interval: 5,
        fast_timer_interval: 10,
        ..Default::default()
    };

    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_save_interval_beyond_free_timeout() {
    let config = RouterConfig {
        object_save_interval: 100,
        object_free_timeout: 30,
        ..Default::default()
    };

    assert!(config.validate().is_err());
}

#[test]
fn retry_intervals_should_be_milliseconds() {
    let config = RouterConfig::default();

    assert_eq!(config.cache_retry_interval().as_millis(), 512);
    assert_eq!(config.object_retry_interval().as_millis(), 512);
}
