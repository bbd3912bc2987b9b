//! Windows VST2 plugins as native Linux plugins.
//!
//! This crate builds the shared object a Linux host loads in place of a
//! Windows plugin. The entry point spawns (or joins) a companion host
//! process that loads the real plugin under the Win32 emulation layer, then
//! forwards every plugin API call over five typed socket channels: control
//! dispatch, MIDI dispatch, host callbacks, parameters, and audio. The
//! bridge is transport only; it implements none of the plugin API's
//! semantics itself.
//!
//! The companion process lives in the `vstbridge-host` crate, which links
//! against this one for the protocol types.
//!
//! ## Entry points
//!
//! `VSTPluginMain` is always exported. The legacy `main` alias some ancient
//! hosts still use is behind the `legacy-entry` feature because an exported
//! unmangled `main` collides with test binaries; distributable builds enable
//! it.

pub mod bridge;
pub mod channel;
pub mod codec;
pub mod config;
pub mod converter;
pub mod error;
pub mod events;
pub mod logging;
pub mod notifications;
pub mod rendezvous;
pub mod vst2;

pub use bridge::Vst2PluginBridge;
pub use error::{BridgeError, Result};

use vst2::abi::{AEffect, HostCallbackProc};

/// The VST2 entry point. Builds a bridge to a freshly hosted Windows plugin
/// and returns the proxy plugin struct, or null when the host process could
/// not be brought up.
///
/// # Safety
///
/// `host_callback` must be a valid `audioMaster` callback for the lifetime
/// of the returned plugin.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn VSTPluginMain(host_callback: HostCallbackProc) -> *mut AEffect {
    match Vst2PluginBridge::launch(host_callback) {
        Ok(bridge) => Vst2PluginBridge::into_effect(bridge),
        Err(err) => {
            logging::init();
            tracing::error!("failed to initialize the plugin bridge: {err}");
            notifications::send_notification(
                "Failed to initialize VST2 plugin",
                &err.to_string(),
            );
            std::ptr::null_mut()
        }
    }
}

/// The pre-2.4 entry point alias. EnergyXT is the only known Linux host
/// that still uses it.
///
/// # Safety
///
/// See [`VSTPluginMain`].
#[cfg(feature = "legacy-entry")]
#[export_name = "main"]
pub unsafe extern "C" fn main_legacy(host_callback: HostCallbackProc) -> *mut AEffect {
    VSTPluginMain(host_callback)
}
