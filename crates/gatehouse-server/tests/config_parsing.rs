use std::time::Duration;
use std::{env, fs};

use gatehouse_auth::ProviderConfig;
use gatehouse_auth::config::UsernameClaims;
use gatehouse_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("gatehouse.toml");

    let toml_content = r#"
[server]
host = "127.0.0.1"
port = 8081
public_url = "https://app.example.com"

[logging]
level = "debug"

[session]
cookie_name = "gh_sid"
idle_timeout = "30m"

[gateway]
login_path = "/auth/login"
default_path = "/home"
app_id = "app-1"
global_ttl = "12h"
request_timeout = "5s"

[provider]
type = "oidc"
issuer = "https://idp.example.com"
client_id = "gatehouse"
client_secret = "s3cret"
username_claims = ["sub", "iss"]

[upstream]
url = "http://127.0.0.1:9000/"
timeout = "15s"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.session.cookie_name, "gh_sid");
    assert_eq!(cfg.session.idle_timeout, Duration::from_secs(30 * 60));
    assert_eq!(cfg.gateway.login_path, "/auth/login");
    assert_eq!(cfg.gateway.global_ttl, Some(Duration::from_secs(12 * 3600)));
    assert_eq!(cfg.gateway.request_timeout, Duration::from_secs(5));
    assert_eq!(cfg.upstream.timeout, Duration::from_secs(15));
    match cfg.provider.as_ref().expect("provider") {
        ProviderConfig::Oidc(oidc) => {
            assert_eq!(oidc.client_id, "gatehouse");
            assert_eq!(oidc.username_claims.names(), vec!["sub", "iss"]);
            assert!(matches!(oidc.username_claims, UsernameClaims::Composite(_)));
        }
        other => panic!("unexpected provider {other:?}"),
    }

    // 2) Env override should win over file
    unsafe {
        env::set_var("GATEHOUSE__SERVER__PORT", "9091");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.server.port, 9091);
    unsafe {
        env::remove_var("GATEHOUSE__SERVER__PORT");
    }

    // 3) A login path without a leading slash is rejected
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[gateway]
login_path = "login"

[provider]
type = "dummy"
username = "dev"
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.starts_with("gateway:"));

    // 4) A provider section is mandatory
    let missing_path = dir.path().join("missing.toml");
    fs::write(&missing_path, "[server]\nport = 8080\n").expect("write toml");
    let err = load_config(missing_path.to_str()).expect_err("expected missing provider");
    assert!(err.contains("[provider]"));
}

#[test]
fn openid2_without_endpoint_uses_steam() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("steam.toml");
    fs::write(
        &path,
        r#"
[provider]
type = "openid2"
"#,
    )
    .expect("write toml");

    let cfg = load_config(path.to_str()).expect("should parse config");
    match cfg.provider.expect("provider") {
        ProviderConfig::Openid2(openid2) => {
            assert_eq!(openid2.endpoint.as_str(), gatehouse_auth::config::STEAM_OPENID_ENDPOINT);
        }
        other => panic!("unexpected provider {other:?}"),
    }
}
