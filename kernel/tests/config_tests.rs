//! Loading kernel settings from disk

use dtt_kernel::ast::Expr;
use dtt_kernel::checker::{whnf, Env};
use dtt_kernel::config::{ConfigError, KernelConfig};
use dtt_kernel::test_support::Prelude;
use std::fs;
use tempfile::tempdir;

#[test]
fn settings_file_is_loaded() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("kernel.toml");
    fs::write(&path, "normalization_fuel = 3\nmax_call_matrices = 16\n").expect("write config");

    let config = KernelConfig::load(&path).expect("valid config");
    assert_eq!(config.normalization_fuel, 3);
    assert_eq!(config.max_call_matrices, 16);
    assert!(!config.unfold_partial);
}

/// Negative test: the file does not exist
#[test]
fn missing_file_is_an_io_error() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("absent.toml");
    match KernelConfig::load(&path) {
        Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected an io error, got {other:?}"),
    }
}

#[test]
fn saved_settings_load_back() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("kernel.toml");
    let config = KernelConfig { unfold_partial: true, ..KernelConfig::default() };
    fs::write(&path, config.to_toml_string().expect("serializable")).expect("write config");
    assert_eq!(KernelConfig::load(&path).expect("valid config"), config);
}

#[test]
fn fuel_limits_reduction() {
    let config = KernelConfig { normalization_fuel: 1, ..KernelConfig::default() };
    let mut prelude = Prelude::with_env(Env::with_config(config));
    let plus = prelude.define_plus();

    // one unfolding: plus 2 0 ~> suc (plus 1 0)
    let sum = Expr::apps(Expr::fun(plus), [prelude.numeral(2), prelude.zero()]);
    let once = Expr::app(Expr::con(prelude.suc, Vec::new()), Expr::apps(Expr::fun(plus), [prelude.numeral(1), prelude.zero()]));
    assert_eq!(whnf(&prelude.env, &sum), once);
}
