use std::io::Write;

use super::*;

fn write_config(extension: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(extension)
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

#[test]
fn defaults_match_resource_constants() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.cache.query_capacity, 1000);
    assert_eq!(settings.cache.fragment_capacity, 1_000_000);
    assert_eq!(
        settings.retention.temporary_retain,
        Duration::from_secs(5 * 60)
    );
    assert_eq!(
        settings.policy.default_fetch_policy,
        FetchPolicy::StoreOrNetwork
    );
    assert_eq!(
        settings.policy.default_live_fetch_policy,
        FetchPolicy::StoreAndNetwork
    );
    assert_eq!(settings.policy.default_render_policy, RenderPolicy::Partial);
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert_eq!(settings.logging.format, LogFormat::Compact);
}

#[test]
fn zero_capacity_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.query_capacity = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero capacity must fail");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.query_capacity",
            ..
        }
    ));
}

#[test]
fn zero_temporary_retain_is_rejected() {
    let mut raw = RawSettings::default();
    raw.retention.temporary_retain_ms = Some(0);

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn unknown_policy_names_the_key() {
    let mut raw = RawSettings::default();
    raw.policy.default_fetch_policy = Some("cache-first".to_string());

    match Settings::from_raw(raw) {
        Err(LoadError::Invalid { key, reason }) => {
            assert_eq!(key, "policy.default_fetch_policy");
            assert!(reason.contains("cache-first"));
        }
        other => panic!("expected invalid policy, got {other:?}"),
    }
}

#[test]
fn explicit_file_overrides_defaults() {
    let file = write_config(
        ".toml",
        r#"
[cache]
query_capacity = 16

[retention]
temporary_retain_ms = 2500

[policy]
default_fetch_policy = "network-only"
default_render_policy = "full"

[logging]
level = "debug"
json = true
"#,
    );

    let settings = load(Some(file.path())).expect("load settings");

    assert_eq!(settings.cache.query_capacity, 16);
    assert_eq!(settings.cache.fragment_capacity, 1_000_000);
    assert_eq!(
        settings.retention.temporary_retain,
        Duration::from_millis(2500)
    );
    assert_eq!(settings.policy.default_fetch_policy, FetchPolicy::NetworkOnly);
    assert_eq!(settings.policy.default_render_policy, RenderPolicy::Full);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.logging.format, LogFormat::Json);
}

#[test]
fn missing_explicit_file_is_a_build_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("absent.toml");

    let err = load(Some(&path)).expect_err("required file is absent");
    assert!(matches!(err, LoadError::Build(_)));
}

#[test]
fn invalid_log_level_is_rejected() {
    let file = write_config(".json", r#"{"logging": {"level": "loud"}}"#);

    let err = load(Some(file.path())).expect_err("invalid level");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}
