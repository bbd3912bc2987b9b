//! Plugin host binary. Spawned by the proxy shared object, either for one
//! plugin (`vstbridge-host <plugin> <endpoint>`) or as a shared group host
//! (`vstbridge-host <group endpoint>`).

use std::path::Path;
use std::process::ExitCode;

use tracing::error;

mod group;
mod host;
mod plugin;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();

    let result = match args.as_slice() {
        [group_endpoint] => group::run_group(Path::new(group_endpoint)),
        [plugin_path, endpoint] => host::run(Path::new(plugin_path), Path::new(endpoint)),
        _ => {
            eprintln!("Usage: vstbridge-host <plugin.dll> <endpoint.sock>");
            eprintln!("       vstbridge-host <group-endpoint.sock>");
            return ExitCode::from(2);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
