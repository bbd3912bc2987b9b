//! Inputs resolved by outside collaborators and consumed here.
//!
//! Plugin discovery, Wine prefix selection, and configuration files are not
//! this crate's job; whatever performs them communicates the results through
//! the environment and through where the shared object is installed.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};

/// Environment variable naming the Windows plugin to load. When unset the
/// path is derived from the shared object's own location (the installer
/// places `<plugin>.so` next to `<plugin>.dll`).
pub const PLUGIN_PATH_ENV: &str = "VSTBRIDGE_PLUGIN_PATH";

/// Environment variable naming the plugin host binary. When unset the binary
/// is looked for next to the shared object, then on `PATH`.
pub const HOST_BINARY_ENV: &str = "VSTBRIDGE_HOST_BINARY";

/// Environment variable selecting group hosting, carrying the group name.
pub const GROUP_ENV: &str = "VSTBRIDGE_GROUP";

pub const HOST_BINARY_NAME: &str = "vstbridge-host";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// The Windows plugin library the host process should load.
    pub plugin_path: PathBuf,
    /// The companion host binary.
    pub host_binary: PathBuf,
    /// Group name when this instance should share a host process.
    pub group: Option<String>,
    /// The Wine prefix the collaborators resolved, if any. Only used to
    /// derive the group endpoint.
    pub wine_prefix: Option<PathBuf>,
}

impl BridgeConfig {
    pub fn from_environment() -> Result<Self> {
        let plugin_path = match std::env::var_os(PLUGIN_PATH_ENV) {
            Some(path) => PathBuf::from(path),
            None => derived_plugin_path()?,
        };
        if !plugin_path.exists() {
            return Err(BridgeError::StartupFailed {
                reason: format!("the plugin library {} does not exist", plugin_path.display()),
            });
        }

        Ok(BridgeConfig {
            plugin_path,
            host_binary: find_host_binary(),
            group: std::env::var(GROUP_ENV).ok().filter(|name| !name.is_empty()),
            wine_prefix: std::env::var_os("WINEPREFIX").map(PathBuf::from),
        })
    }

    /// The host architecture tag used in the group endpoint derivation.
    pub fn arch(&self) -> &'static str {
        std::env::consts::ARCH
    }
}

/// `<plugin>.so` sits next to `<plugin>.dll`; swap the extension of our own
/// library location.
fn derived_plugin_path() -> Result<PathBuf> {
    let library = this_library_path().ok_or_else(|| BridgeError::StartupFailed {
        reason: format!(
            "could not locate this shared object; set {PLUGIN_PATH_ENV} to the plugin's .dll"
        ),
    })?;
    Ok(library.with_extension("dll"))
}

/// The filesystem location of the shared object this code lives in, via
/// `dladdr` on one of our own symbols.
pub fn this_library_path() -> Option<PathBuf> {
    use std::os::unix::ffi::OsStrExt;

    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let probe: fn() -> Option<PathBuf> = this_library_path;
    let resolved = unsafe { libc::dladdr(probe as *const c_void, &mut info) };
    if resolved == 0 || info.dli_fname.is_null() {
        return None;
    }

    let raw = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) };
    Some(PathBuf::from(std::ffi::OsStr::from_bytes(raw.to_bytes())))
}

fn find_host_binary() -> PathBuf {
    if let Some(path) = std::env::var_os(HOST_BINARY_ENV) {
        return PathBuf::from(path);
    }

    if let Some(sibling) = this_library_path()
        .as_deref()
        .and_then(Path::parent)
        .map(|dir| dir.join(HOST_BINARY_NAME))
    {
        if sibling.exists() {
            return sibling;
        }
    }

    // Fall back to PATH resolution by the spawn call.
    PathBuf::from(HOST_BINARY_NAME)
}
