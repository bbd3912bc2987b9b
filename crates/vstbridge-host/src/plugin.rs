//! Loading the real plugin library and talking to its raw dispatcher.

use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;

use vstbridge::error::{BridgeError, Result};
use vstbridge::events::PluginDescriptor;
use vstbridge::vst2::abi::{AEffect, HostCallbackProc, VST_MAGIC};

use crate::host::HostShared;

type EntryPoint = unsafe extern "C" fn(HostCallbackProc) -> *mut AEffect;

/// The plugin library plus the `AEffect` it handed us.
pub struct LoadedPlugin {
    // Dropped last; the effect pointer dies with the library.
    _library: libloading::Library,
    effect: *mut AEffect,
}

// SAFETY: the bridge protocol mirrors the host threading model the plugin
// already has to live with. Control dispatch, MIDI dispatch, parameters and
// audio each run on one fixed thread, exactly like the native host threads
// the plugin would otherwise see.
unsafe impl Send for LoadedPlugin {}
unsafe impl Sync for LoadedPlugin {}

impl LoadedPlugin {
    /// dlopen the plugin and run its entry point. The host callbacks the
    /// plugin makes while initializing are routed through `shared`, which
    /// must already be connected.
    pub fn load(path: &Path, shared: &Arc<HostShared>) -> Result<Self> {
        let library = unsafe { libloading::Library::new(path) }.map_err(|err| {
            BridgeError::PluginLoadFailed {
                path: path.to_path_buf(),
                reason: format!("could not open the library: {err}"),
            }
        })?;

        let entry: libloading::Symbol<EntryPoint> = unsafe {
            library
                .get(b"VSTPluginMain\0")
                .or_else(|_| library.get(b"main\0"))
        }
        .map_err(|err| BridgeError::PluginLoadFailed {
            path: path.to_path_buf(),
            reason: format!("no VST2 entry point: {err}"),
        })?;

        // The plugin calls back into the host during its entry point,
        // before any effect pointer exists to hang context off.
        crate::host::set_loading_shared(Arc::as_ptr(shared));
        let effect = unsafe { entry(crate::host::host_callback_trampoline) };
        crate::host::set_loading_shared(std::ptr::null());

        if effect.is_null() {
            return Err(BridgeError::PluginLoadFailed {
                path: path.to_path_buf(),
                reason: "the entry point returned null".to_string(),
            });
        }
        if unsafe { (*effect).magic } != VST_MAGIC {
            return Err(BridgeError::PluginLoadFailed {
                path: path.to_path_buf(),
                reason: "the returned struct is not a VST2 plugin".to_string(),
            });
        }

        // Callbacks made after this point find their context through the
        // user slot instead of the loader thread.
        unsafe {
            (*effect).user = Arc::as_ptr(shared) as *mut c_void;
        }

        Ok(LoadedPlugin {
            _library: library,
            effect,
        })
    }

    pub fn dispatch(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        data: *mut c_void,
        option: f32,
    ) -> isize {
        unsafe { ((*self.effect).dispatcher)(self.effect, opcode, index, value, data, option) }
    }

    pub fn process_replacing(&self, inputs: &[*const f32], outputs: &mut [*mut f32], frames: i32) {
        unsafe {
            ((*self.effect).process_replacing)(
                self.effect,
                inputs.as_ptr(),
                outputs.as_mut_ptr(),
                frames,
            )
        }
    }

    pub fn set_parameter(&self, index: i32, value: f32) {
        unsafe { ((*self.effect).set_parameter)(self.effect, index, value) }
    }

    pub fn get_parameter(&self, index: i32) -> f32 {
        unsafe { ((*self.effect).get_parameter)(self.effect, index) }
    }

    pub fn descriptor(&self) -> PluginDescriptor {
        unsafe { PluginDescriptor::from_effect(&*self.effect) }
    }

    pub fn num_inputs(&self) -> usize {
        unsafe { (*self.effect).num_inputs.max(0) as usize }
    }

    pub fn num_outputs(&self) -> usize {
        unsafe { (*self.effect).num_outputs.max(0) as usize }
    }
}
