use std::time::Duration;

use tempfile::NamedTempFile;
use trawl_config::{ConfigError, TrawlConfig};

#[test]
fn empty_file_yields_defaults() {
    let config = TrawlConfig::load_from_str("").expect("empty config should parse");
    assert_eq!(config, TrawlConfig::default());
    assert_eq!(config.search.searcher_url, "k8s+http://searcher:3181");
    assert!(config.search.index_enabled);
    assert!(config.logging.stderr);
}

#[test]
fn overrides_are_applied() {
    let text = r#"
[search]
searcher_url = "http://10.0.0.1:3181 http://10.0.0.2:3181"
index_enabled = false
fanout_factor = 4
discovery_ready_timeout_ms = 250

[logging]
level = "trawl_search=debug"
json = true
"#;

    let config = TrawlConfig::load_from_str(text).expect("config should parse");
    assert!(!config.search.index_enabled);
    assert_eq!(config.search.fanout_factor, 4);
    assert_eq!(
        config.search.discovery_ready_timeout(),
        Some(Duration::from_millis(250))
    );
    assert_eq!(config.search.many_repos_fetch_timeout_ms, 500);
    assert_eq!(config.logging.level, "trawl_search=debug");
    assert!(config.logging.json);
}

#[test]
fn unknown_keys_are_rejected() {
    let text = r#"
[search]
fanout_facter = 4
"#;

    let err = TrawlConfig::load_from_str(text).expect_err("typo should be rejected");
    assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
    assert!(err.to_string().contains("fanout_facter"), "{err}");
}

#[test]
fn zero_fanout_is_invalid() {
    let err = TrawlConfig::load_from_str("[search]\nfanout_factor = 0\n")
        .expect_err("zero fanout should be rejected");
    assert!(matches!(err, ConfigError::Invalid(_)), "{err:?}");
}

#[test]
fn attempt_budget_is_not_configurable() {
    let err = TrawlConfig::load_from_str("[search]\nmax_attempts = 5\n")
        .expect_err("the attempt budget is fixed");
    assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
    assert!(err.to_string().contains("max_attempts"), "{err}");
}

#[test]
fn load_from_path_reads_file() {
    let file = NamedTempFile::new().expect("tempfile");
    std::fs::write(file.path(), "[search]\nfanout_factor = 8\n").expect("write config");

    let config = TrawlConfig::load_from_path(file.path()).expect("config should load");
    assert_eq!(config.search.fanout_factor, 8);
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nope.toml");

    let err = TrawlConfig::load_from_path(&path).expect_err("missing file");
    match err {
        ConfigError::Io { path: reported, .. } => assert!(reported.ends_with("nope.toml")),
        other => panic!("unexpected error: {other:?}"),
    }
}
