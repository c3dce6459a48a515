//! Integration tests for prerender-config

use prerender_config::*;
use std::io::Write;
use std::time::Duration;
use temp_env::with_vars;

#[test]
fn test_default_config_validation() {
    let config = PrerenderConfig::default();
    assert!(config.validate_all().is_ok());
}

#[test]
fn test_config_loader_from_env() {
    let vars = vec![
        ("PRERENDER_POOL_SIZE", Some("4")),
        ("PRERENDER_REALIZATION", Some("process")),
        ("PRERENDER_MAX_MEMORY_MB", Some("512")),
        ("PRERENDER_REQUEST_TIMEOUT_SECONDS", Some("0")),
        ("PRERENDER_LOG_LEVEL", Some("debug")),
    ];

    with_vars(vars, || {
        let config = ConfigLoader::new().from_env().unwrap();

        assert_eq!(config.pool.pool_size, 4);
        assert_eq!(config.pool.realization, Realization::Process);
        assert_eq!(config.pool.drain_strategy(), DrainStrategy::EagerDrain);
        assert_eq!(config.pool.max_memory_mb, 512);
        assert_eq!(config.pool.request_timeout, None);
        assert_eq!(config.logging.level, LogLevel::Debug);
    });
}

#[test]
fn test_invalid_env_value_reported() {
    with_vars(vec![("PRERENDER_POOL_SIZE", Some("many"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::EnvError(ref msg) if msg.contains("POOL_SIZE")));
    });
}

#[test]
fn test_custom_prefix() {
    with_vars(vec![("SSR_DRAIN_STRATEGY", Some("immediate"))], || {
        let config = ConfigLoader::with_prefix("SSR").from_env().unwrap();
        assert_eq!(config.pool.drain_strategy, Some(DrainStrategy::ImmediateReplace));
    });
}

#[test]
fn test_yaml_file_with_env_override() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
pool:
  pool_size: 3
  realization: process
  request_timeout: 45s
  worker:
    program: /opt/prerender/bin/prerender-worker
    args: ["--quiet"]
logging:
  level: warn
"#
    )
    .unwrap();

    with_vars(vec![("PRERENDER_POOL_SIZE", Some("6"))], || {
        let config = ConfigLoader::new().from_file(file.path()).unwrap();

        assert_eq!(config.pool.pool_size, 6);
        assert_eq!(config.pool.request_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.pool.worker.args, vec!["--quiet".to_string()]);
        assert_eq!(config.logging.level, LogLevel::Warn);
    });
}

#[test]
fn test_yaml_config_round_trip_validates() {
    let config = PrerenderConfig::default();
    let yaml = serde_yaml::to_string(&config).unwrap();

    let parsed: PrerenderConfig = serde_yaml::from_str(&yaml).unwrap();
    assert!(parsed.validate_all().is_ok());
}
