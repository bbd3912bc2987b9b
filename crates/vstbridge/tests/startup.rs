//! Startup failure surface of the entry point.
//!
//! One test, one binary: it owns the process environment while it runs, so
//! the phases run back to back instead of as parallel tests.

use std::ffi::c_void;
use std::time::{Duration, Instant};

use vstbridge::vst2::abi::AEffect;

unsafe extern "C" fn dummy_host_callback(
    _effect: *mut AEffect,
    opcode: i32,
    _index: i32,
    _value: isize,
    _data: *mut c_void,
    _option: f32,
) -> isize {
    if opcode == vstbridge::vst2::abi::host_opcodes::VERSION {
        vstbridge::vst2::abi::VST_VERSION
    } else {
        0
    }
}

#[test]
fn test_startup_failures_return_null() {
    // The plugin library itself has to exist; the failures under test are
    // about the host process, not the plugin file.
    let plugin = std::env::temp_dir().join(format!(
        "vstbridge_fake_plugin_{}.dll",
        std::process::id()
    ));
    std::fs::write(&plugin, b"MZ not actually a plugin").unwrap();
    std::env::set_var(vstbridge::config::PLUGIN_PATH_ENV, &plugin);
    std::env::remove_var(vstbridge::config::GROUP_ENV);

    // Phase 1: the host binary exists but dies before dialing back. The
    // liveness probe polls at one second; detection must not take more than
    // two cycles (plus slack for a loaded machine).
    std::env::set_var(vstbridge::config::HOST_BINARY_ENV, "/bin/false");
    let started = Instant::now();
    let effect = unsafe { vstbridge::VSTPluginMain(dummy_host_callback) };
    let elapsed = started.elapsed();

    assert!(effect.is_null(), "a dead host must surface as a null plugin");
    assert!(
        elapsed < Duration::from_secs(4),
        "startup failure took {elapsed:?}"
    );

    // Phase 2: the host binary cannot even be spawned.
    std::env::set_var(
        vstbridge::config::HOST_BINARY_ENV,
        "/nonexistent/vstbridge-host",
    );
    let effect = unsafe { vstbridge::VSTPluginMain(dummy_host_callback) };
    assert!(effect.is_null());

    let _ = std::fs::remove_file(&plugin);
}
