use super::*;

#[test]
fn test_config_default() {
    let config = Config::default();

    // 测试默认值
    assert_eq!(config.general.log_level, "info");
    assert_eq!(config.database.max_connections, 5);
    assert_eq!(config.database.acquire_timeout_secs, 30);
    assert!(config.database.wal);

    assert_eq!(config.retention.detailed_days, 7);
    assert_eq!(config.retention.aggregated_days, 90);
    assert_eq!(config.monitor.poll_interval_secs, 30);

    assert!(config.retry.policies.contains_key("database"));
    assert!(config.retry.policies.contains_key("database_connect"));
    assert!(config.retry.policies.contains_key("miner_io"));
    assert!(config.is_valid());
}

#[test]
fn test_config_validation() {
    let mut config = Config::default();

    // 测试无效连接数
    config.database.max_connections = 0;
    assert!(!config.is_valid());
    config.database.max_connections = 2;
    assert!(config.is_valid());

    // 测试保留策略
    config.retention.aggregated_days = 3;
    assert!(!config.is_valid());
    config.retention.aggregated_days = 30;
    assert!(config.is_valid());

    // 测试缓存容量
    config.cache.capacity = 0;
    assert!(!config.is_valid());
}

#[test]
fn test_retry_policy_validation() {
    let mut config = Config::default();

    if let Some(policy) = config.retry.policies.get_mut("database") {
        policy.multiplier = 0.5;
    }
    assert!(!config.is_valid());

    let mut config = Config::default();
    if let Some(policy) = config.retry.policies.get_mut("miner_io") {
        policy.base_delay_ms = 60_000;
        policy.max_delay_ms = 1_000;
    }
    assert!(!config.is_valid());

    let mut config = Config::default();
    config.breakers.overrides.insert(
        "miner:m1".to_string(),
        CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        },
    );
    assert!(!config.is_valid());
}

#[test]
fn test_partial_toml_uses_defaults() {
    let content = r#"
        [database]
        path = "/var/lib/hashwatch/metrics.db"
        max_connections = 2

        [retry.policies.database]
        max_attempts = 4
        base_delay_ms = 100
        max_delay_ms = 2000
        multiplier = 2.0
        jitter = false
        breaker = "database"

        [breakers.default]
        failure_threshold = 3
        recovery_timeout = 30
        success_threshold = 1

        [breakers.overrides."miner:m1"]
        failure_threshold = 10
        recovery_timeout = 5.5
        success_threshold = 2
    "#;

    let config: Config = toml::from_str(content).unwrap();
    assert_eq!(config.database.max_connections, 2);
    assert_eq!(config.database.acquire_timeout_secs, 30);
    assert_eq!(config.cache.capacity, 1000);
    assert_eq!(config.breakers.default.failure_threshold, 3);
    assert_eq!(config.breakers.default.recovery_timeout, Duration::from_secs(30));
    assert_eq!(
        config.breakers.overrides["miner:m1"].recovery_timeout,
        Duration::from_millis(5500)
    );

    let policy = config.retry.policy("database");
    assert_eq!(policy.max_attempts(), 4);
    assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
    assert_eq!(policy.breaker(), Some("database"));
    assert!(config.is_valid());
}

#[test]
fn test_unknown_policy_falls_back_to_default() {
    let config = Config::default();
    assert_eq!(config.retry.policy("http"), RetryPolicy::default());
}

#[test]
fn test_save_and_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hashwatch.toml");
    let path = path.to_str().unwrap();

    let mut config = Config::default();
    config.monitor.poll_interval_secs = 15;
    config.save(path).unwrap();

    let loaded = Config::load(path).unwrap();
    assert_eq!(loaded.monitor.poll_interval_secs, 15);
    assert_eq!(loaded.retry.policies, config.retry.policies);
}

#[test]
fn test_missing_file_uses_defaults() {
    let config = Config::load_or_default("/nonexistent/hashwatch.toml").unwrap();
    assert_eq!(config.database.max_connections, 5);
    assert!(Config::load("/nonexistent/hashwatch.toml").is_err());
}

#[test]
fn test_args_override_config() {
    let args = Args::parse_from(["hashwatch", "--log-level", "warn", "--database", "/tmp/x.db"]);
    let mut config = Config::default();
    config.apply_args(&args);

    assert_eq!(config.general.log_level, "warn");
    assert_eq!(config.database.path, PathBuf::from("/tmp/x.db"));
    assert_eq!(config.log_config().level, "warn");
}
