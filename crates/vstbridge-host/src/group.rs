//! Group host mode: one process hosting many plugin instances.
//!
//! Proxies that share a group name rendezvous on a well known socket. Each
//! request names a plugin and a fresh endpoint; the group host answers with
//! its PID (the proxy's liveness probe needs it) and hosts the plugin on its
//! own thread. Once the last plugin leaves and nothing new arrives within a
//! grace period, the process retires itself.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use vstbridge::error::Result;
use vstbridge::rendezvous::{read_group_message, write_group_message, GroupRequest, GroupResponse};

use crate::host;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub fn run_group(endpoint: &Path) -> Result<()> {
    // Two proxies may race to spawn the first group host. If another
    // process already answers on the socket, this one is redundant and
    // bows out; its proxy will reach the winner on its next retry.
    if std::os::unix::net::UnixStream::connect(endpoint).is_ok() {
        info!(
            endpoint = %endpoint.display(),
            "another group host is already serving this endpoint, exiting"
        );
        return Ok(());
    }

    // A leftover socket file from a crashed host would fail the bind.
    let _ = std::fs::remove_file(endpoint);
    let listener = std::os::unix::net::UnixListener::bind(endpoint)?;
    info!(endpoint = %endpoint.display(), "group host accepting plugins");

    let active = Arc::new(AtomicUsize::new(0));

    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to accept a group connection: {err}");
                continue;
            }
        };

        let request: GroupRequest = match read_group_message(&mut stream) {
            Ok(request) => request,
            Err(err) => {
                warn!("dropping a malformed group request: {err}");
                continue;
            }
        };
        if let Err(err) = write_group_message(
            &mut stream,
            &GroupResponse {
                pid: std::process::id(),
            },
        ) {
            warn!("could not acknowledge a group request: {err}");
            continue;
        }

        active.fetch_add(1, Ordering::AcqRel);
        let active = Arc::clone(&active);
        let endpoint = endpoint.to_path_buf();
        let thread_active = Arc::clone(&active);
        let thread_endpoint = endpoint.clone();
        let spawned = std::thread::Builder::new()
            .name("plugin-host".to_string())
            .spawn(move || {
                if let Err(err) = host::run(&request.plugin_path, &request.endpoint) {
                    error!(
                        plugin = %request.plugin_path.display(),
                        "hosting failed: {err}"
                    );
                }

                if thread_active.fetch_sub(1, Ordering::AcqRel) == 1 {
                    schedule_shutdown(thread_active, thread_endpoint);
                }
            });
        if let Err(err) = spawned {
            error!("could not spawn a hosting thread: {err}");
            active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    Ok(())
}

/// The last plugin just left. Give a new proxy a moment to show up, then
/// retire the process; an exit here also closes the listener.
fn schedule_shutdown(active: Arc<AtomicUsize>, endpoint: PathBuf) {
    let thread_endpoint = endpoint.clone();
    let spawned = std::thread::Builder::new()
        .name("group-shutdown".to_string())
        .spawn(move || {
            std::thread::sleep(SHUTDOWN_GRACE);
            if active.load(Ordering::Acquire) == 0 {
                info!("all plugins exited, shutting the group host down");
                let _ = std::fs::remove_file(&thread_endpoint);
                std::process::exit(0);
            }
        });
    if spawned.is_err() {
        let _ = std::fs::remove_file(&endpoint);
        std::process::exit(0);
    }
}
