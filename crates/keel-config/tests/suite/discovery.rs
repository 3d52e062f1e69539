use std::ffi::OsString;
use std::path::Path;

use keel_config::{
    discover_config_path, load_for_root, with_config_env_lock, KeelConfig, KEEL_CACHE_DIR_ENV_VAR,
    KEEL_CONFIG_ENV_VAR,
};
use tempfile::tempdir;

struct EnvVarGuard {
    key: &'static str,
    prev: Option<OsString>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: &Path) -> Self {
        let prev = std::env::var_os(key);
        std::env::set_var(key, value);
        Self { key, prev }
    }

    fn unset(key: &'static str) -> Self {
        let prev = std::env::var_os(key);
        std::env::remove_var(key);
        Self { key, prev }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => std::env::set_var(self.key, v),
            None => std::env::remove_var(self.key),
        }
    }
}

#[test]
fn discovers_keel_toml_in_root() {
    with_config_env_lock(|| {
        let _env = EnvVarGuard::unset(KEEL_CONFIG_ENV_VAR);
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("keel.toml");
        std::fs::write(&config_path, "[evaluation]\nmax_reasons = 1\n").unwrap();

        let discovered = discover_config_path(dir.path()).unwrap();
        assert_eq!(discovered, config_path.canonicalize().unwrap());

        let (config, path) = load_for_root(dir.path()).unwrap();
        assert_eq!(config.evaluation.max_reasons, 1);
        assert_eq!(path, Some(discovered));
    });
}

#[test]
fn env_var_overrides_the_root_config() {
    with_config_env_lock(|| {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("keel.toml"), "[evaluation]\nmax_reasons = 1\n").unwrap();
        std::fs::write(dir.path().join("custom.toml"), "[evaluation]\nmax_reasons = 7\n").unwrap();
        let _env = EnvVarGuard::set(KEEL_CONFIG_ENV_VAR, Path::new("custom.toml"));

        let (config, path) = load_for_root(dir.path()).unwrap();
        assert_eq!(config.evaluation.max_reasons, 7);
        assert_eq!(path, Some(dir.path().join("custom.toml").canonicalize().unwrap()));
    });
}

#[test]
fn missing_config_loads_defaults() {
    with_config_env_lock(|| {
        let _env = EnvVarGuard::unset(KEEL_CONFIG_ENV_VAR);
        let dir = tempdir().unwrap();
        let (config, path) = load_for_root(dir.path()).unwrap();
        assert_eq!(config, KeelConfig::default());
        assert_eq!(path, None);
    });
}

#[test]
fn cache_dir_env_var_wins() {
    with_config_env_lock(|| {
        let dir = tempdir().unwrap();
        let _env = EnvVarGuard::set(KEEL_CACHE_DIR_ENV_VAR, dir.path());
        let config = KeelConfig::load_from_str("[cache]\ndir = \"ignored\"\n").unwrap();
        assert_eq!(config.cache_dir(Path::new("/work")), dir.path());
    });
}
