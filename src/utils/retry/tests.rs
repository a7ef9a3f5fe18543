use super::*;

fn steady(base_ms: u64, max_ms: u64) -> RetryConfig {
    RetryConfig {
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_millis(max_ms),
        max_retries: 4,
        jitter: 0.0,
    }
}

#[test]
fn test_delay_doubles_until_cap() {
    let config = steady(250, 1_500);

    let delays: Vec<u128> = (0..5)
        .map(|attempt| config.delay_for_attempt(attempt).as_millis())
        .collect();
    assert_eq!(delays, vec![250, 500, 1_000, 1_500, 1_500]);
}

#[test]
fn test_huge_attempt_numbers_stay_capped() {
    let config = steady(1_000, 60_000);
    assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(60));
}

#[test]
fn test_jitter_stays_within_fraction() {
    let config = RetryConfig {
        jitter: 0.5,
        ..steady(2_000, 10_000)
    };

    for _ in 0..50 {
        let ms = config.delay_for_attempt(0).as_millis();
        assert!((1_000..=3_000).contains(&ms), "delay {ms}ms outside band");
    }
}

#[test]
fn test_retry_at_uses_failed_attempt_count() {
    let config = steady(100, 10_000);

    assert_eq!(config.retry_at(1, 5_000), 5_100);
    assert_eq!(config.retry_at(3, 5_000), 5_400);
    // A row with no recorded failure is treated as its first.
    assert_eq!(config.retry_at(0, 5_000), 5_100);
}

#[test]
fn test_row_is_dead_after_max_retries() {
    let config = steady(100, 1_000);

    assert!(config.should_retry(3));
    assert!(!config.should_retry(4));
}
