use super::*;
use serial_test::serial;
use std::env;

fn cleanup_test_env() {
    env::remove_var("RALPH_BASE_DIR");
    env::remove_var("RALPH_DEFAULT_TEAM");
    env::remove_var("RALPH_DEFAULT_AGENT_COUNT");
    env::remove_var("RALPH_CLAIM_TIMEOUT_SECS");
    env::remove_var("RALPH_SHUTDOWN_GRACE_SECS");
}

#[test]
#[serial]
fn load_applies_defaults_when_unset() {
    cleanup_test_env();
    let config = Config::load().unwrap();
    assert_eq!(config.default_team_id, "default");
    assert_eq!(config.default_agent_count, constants::MIN_AGENT_COUNT);
    cleanup_test_env();
}

#[test]
#[serial]
fn load_reads_overrides_from_env() {
    cleanup_test_env();
    env::set_var("RALPH_DEFAULT_TEAM", "squad-a");
    env::set_var("RALPH_DEFAULT_AGENT_COUNT", "3");
    let config = Config::load().unwrap();
    assert_eq!(config.default_team_id, "squad-a");
    assert_eq!(config.default_agent_count, 3);
    cleanup_test_env();
}

#[test]
#[serial]
fn agent_count_is_clamped_on_load() {
    cleanup_test_env();
    env::set_var("RALPH_DEFAULT_AGENT_COUNT", "99");
    let config = Config::load().unwrap();
    assert_eq!(config.default_agent_count, constants::MAX_AGENT_COUNT);
    cleanup_test_env();
}

#[test]
fn team_config_defaults_when_file_missing() {
    let config = Config {
        base_dir: std::env::temp_dir().join("ralph-test-nonexistent"),
        default_team_id: "default".to_string(),
        default_claim_timeout_secs: 60,
        default_shutdown_grace_secs: 60,
        default_agent_count: 2,
    };
    let team_config = load_team_config(&config, "missing-team").unwrap();
    assert_eq!(team_config.agent_count, constants::MIN_AGENT_COUNT);
}

#[test]
fn team_config_loads_and_tolerates_unknown_fields() {
    let dir = tempfile::tempdir().unwrap();
    let base_dir = dir.path().to_path_buf();
    let config = Config {
        base_dir: base_dir.clone(),
        default_team_id: "default".to_string(),
        default_claim_timeout_secs: 60,
        default_shutdown_grace_secs: 60,
        default_agent_count: 2,
    };
    let team_dir = base_dir.join("teams").join("squad-a");
    std::fs::create_dir_all(&team_dir).unwrap();
    std::fs::write(
        team_dir.join("config.json"),
        r#"{"agent_count": 5, "totally_unknown_field": true}"#,
    )
    .unwrap();

    let team_config = load_team_config(&config, "squad-a").unwrap();
    assert_eq!(team_config.agent_count, 5);
}
