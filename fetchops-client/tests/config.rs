use std::io::Write;

use fetchops_client::config::{
    DEFAULT_WORKER_URL, MAX_CONFIG_BYTES, SavedClientConfig, load_config_from_path,
    parse_config_json, save_config_to_path, validate_config, validate_worker_url,
};

#[test]
fn load_config_rejects_oversized_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("client.json");

    let mut file = std::fs::File::create(&path).expect("create client.json");
    file.write_all(&vec![b'a'; (MAX_CONFIG_BYTES as usize) + 1024])
        .expect("write oversized client.json");
    drop(file);

    let err = load_config_from_path(&path).expect_err("oversized file should error");
    let msg = err.to_string();
    assert!(msg.contains("too large"), "unexpected error: {msg}");
}

#[test]
fn saved_config_loads_back() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("client.json");
    let config = SavedClientConfig {
        worker_url: "wss://worker.example.test/ws".to_owned(),
        local: false,
        cache_dir: dir.path().join("cache"),
    };

    save_config_to_path(&path, &config).expect("save config");
    save_config_to_path(&path, &config).expect("overwrite config");
    assert_eq!(load_config_from_path(&path).expect("load config"), config);
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn missing_fields_take_defaults() {
    let config = parse_config_json("{}").expect("parse empty object");
    assert_eq!(config, SavedClientConfig::default());
    assert_eq!(config.worker_url, DEFAULT_WORKER_URL);
}

#[test]
fn worker_url_must_be_a_websocket_url() {
    assert!(validate_worker_url("ws://127.0.0.1:8080/ws").is_ok());
    assert!(validate_worker_url("  ").is_err());
    assert!(validate_worker_url("not a url").is_err());

    let err = validate_worker_url("http://127.0.0.1:8080/ws").expect_err("http is not ws");
    assert!(err.contains("ws or wss"), "unexpected error: {err}");
}

#[test]
fn local_config_skips_worker_url_check() {
    let config = SavedClientConfig {
        worker_url: String::new(),
        local: true,
        ..SavedClientConfig::default()
    };
    assert!(validate_config(&config).is_ok());

    let remote = SavedClientConfig {
        local: false,
        ..config
    };
    assert!(validate_config(&remote).is_err());
}

#[test]
fn invalid_saved_config_is_rejected_on_load() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("client.json");
    std::fs::write(&path, r#"{"worker_url": "ftp://worker"}"#).expect("write config");

    let err = load_config_from_path(&path).expect_err("ftp URL is invalid");
    assert!(err.to_string().contains("invalid config"), "unexpected error: {err}");
}
