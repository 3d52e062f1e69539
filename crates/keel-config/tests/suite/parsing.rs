use std::path::Path;
use std::time::Duration;

use keel_cache::{FILE_HASHES, TASK_HISTORY};
use keel_config::{ByteSize, ConfigError, KeelConfig};

#[test]
fn empty_config_uses_defaults() {
    let config = KeelConfig::load_from_str("").unwrap();
    assert_eq!(config, KeelConfig::default());
    assert_eq!(config.cache.history_depth, 3);
    assert_eq!(config.evaluation.max_reasons, 3);
    assert_eq!(config.logging.level, "info");
    assert!(config.logging.stderr);
}

#[test]
fn cache_section_maps_onto_runtime_config() {
    let text = r#"
[cache]
dir = "/var/cache/keel"
max_heap = "512M"
history_depth = 5
batch_window_ms = 50
max_locking_time_ms = 1000
queue_capacity = 16

[cache.capacities]
fileHashes = 1234

[evaluation]
max_reasons = 10
"#;
    let config = KeelConfig::load_from_str(text).unwrap();
    assert_eq!(config.cache.max_heap, Some(ByteSize(512 * 1024 * 1024)));

    let session = config.session_config(Path::new("/work"));
    assert_eq!(session.cache_dir, Path::new("/var/cache/keel"));
    assert_eq!(session.history_depth, 5);
    assert_eq!(session.max_reasons, 10);
    assert_eq!(session.worker.batch_window, Duration::from_millis(50));
    assert_eq!(session.worker.max_locking_time, Duration::from_secs(1));
    assert_eq!(session.worker.queue_capacity, 16);
    assert_eq!(session.capacities.max_heap_bytes(), 512 * 1024 * 1024);
    assert_eq!(session.capacities.capacity_for(FILE_HASHES), 1234);
    // Half a GiB scales the baseline of 2000 down by half.
    assert_eq!(session.capacities.capacity_for(TASK_HISTORY), 1000);
}

#[test]
fn integer_heap_sizes_are_bytes() {
    let config = KeelConfig::load_from_str("[cache]\nmax_heap = 4096\n").unwrap();
    assert_eq!(config.cache.max_heap, Some(ByteSize(4096)));
}

#[test]
fn unknown_keys_are_rejected() {
    let err = KeelConfig::load_from_str("[cache]\nhistroy_depth = 2\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)), "{err}");
}

#[test]
fn zero_history_depth_is_invalid() {
    let err = KeelConfig::load_from_str("[cache]\nhistory_depth = 0\n").unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            field: "cache.history_depth",
            ..
        }
    ));
}

#[test]
fn relative_cache_dirs_resolve_against_the_root() {
    let config = KeelConfig::load_from_str("[cache]\ndir = \"build/cache\"\n").unwrap();
    let dir = keel_config::with_config_env_lock(|| {
        std::env::remove_var(keel_config::KEEL_CACHE_DIR_ENV_VAR);
        config.cache_dir(Path::new("/work"))
    });
    assert_eq!(dir, Path::new("/work/build/cache"));
}
