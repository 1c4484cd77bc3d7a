use crate::{
    env_from_str, env_w_default, env_wo_default, parse_env_bool, Env,
    RuntimeOptions,
};

#[test]
fn env_from_str_test() {
    assert!(matches!(env_from_str("dev").unwrap(), Env::DEV));
    assert!(matches!(env_from_str("development").unwrap(), Env::DEV));
    assert!(matches!(env_from_str("DEV").unwrap(), Env::DEV));
    assert!(matches!(env_from_str("prod").unwrap(), Env::PROD));
    assert!(matches!(env_from_str("PRODUCTION").unwrap(), Env::PROD));
    assert!(env_from_str("TEST").is_err());
    assert!(env_from_str("?").is_err());
}

#[test]
fn bool_from_str_test() {
    assert!(parse_env_bool("true").unwrap());
    assert!(parse_env_bool("ON").unwrap());
    assert!(!parse_env_bool("0").unwrap());
    assert!(parse_env_bool("maybe").is_err());
}

#[test]
fn env_w_default_test() {
    temp_env::with_var("VARS_CONFIG_ENV_TEST", Some("custom"), || {
        assert_eq!(
            env_w_default("VARS_CONFIG_ENV_TEST", "default").unwrap(),
            String::from("custom")
        );
    });

    temp_env::with_var_unset("VARS_CONFIG_ENV_TEST", || {
        assert_eq!(
            env_w_default("VARS_CONFIG_ENV_TEST", "default").unwrap(),
            String::from("default")
        );
    });
}

#[test]
fn env_wo_default_test() {
    temp_env::with_var("VARS_CONFIG_ENV_TEST", Some("custom"), || {
        assert_eq!(
            env_wo_default("VARS_CONFIG_ENV_TEST").unwrap(),
            Some(String::from("custom"))
        );
    });

    temp_env::with_var_unset("VARS_CONFIG_ENV_TEST", || {
        assert_eq!(env_wo_default("VARS_CONFIG_ENV_TEST").unwrap(), None);
    });
}

#[test]
fn try_from_env_test() {
    let config = temp_env::with_vars(
        [
            ("VARS_BASE_URL", Some("http://localhost:8000")),
            ("VARS_WS_PATH", Some("/ws")),
            ("VARS_MAX_ATTEMPTS", Some("3")),
            ("VARS_RETRY_DELAY_MS", Some("10")),
            ("VARS_MAX_RETRY_DELAY_MS", Some("40")),
            ("VARS_LIVE_RELOAD", None),
            ("VARS_PERSIST_DEBOUNCE_MS", Some("0")),
            ("VARS_ENV", Some("PROD")),
        ],
        || RuntimeOptions::try_from_env().unwrap(),
    );

    assert_eq!(config.base_url.as_ref(), "http://localhost:8000");
    assert_eq!(config.ws_path.as_ref(), "/ws");
    assert_eq!(config.max_attempts, Some(3));
    assert_eq!(config.retry_delay_ms, 10);
    assert_eq!(config.max_retry_delay_ms, 40);
    assert_eq!(config.persist_debounce_ms, 0);
    assert_eq!(config.env, Env::PROD);
    assert!(!config.live_reload());
    assert_eq!(config.ws_url(), "ws://localhost:8000/ws");
}

#[test]
fn invalid_number_is_rejected() {
    temp_env::with_var("VARS_MAX_ATTEMPTS", Some("lots"), || {
        assert!(RuntimeOptions::try_from_env().is_err());
    });
}

#[test]
fn live_reload_defaults_follow_env() {
    let dev = RuntimeOptions::builder().env(Env::DEV).build();
    assert!(dev.live_reload());
    let prod = RuntimeOptions::builder().env(Env::PROD).build();
    assert!(!prod.live_reload());
    let forced = RuntimeOptions::builder()
        .env(Env::PROD)
        .live_reload(true)
        .build();
    assert!(forced.live_reload());
}
