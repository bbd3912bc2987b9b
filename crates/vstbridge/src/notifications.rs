//! Desktop notification collaborator.
//!
//! Startup failures happen inside a host that usually swallows our log
//! output, so the user also gets a desktop notification. Delivery is best
//! effort; a system without `notify-send` just doesn't get one.

use std::process::{Command, Stdio};

use tracing::debug;

pub fn send_notification(summary: &str, body: &str) {
    let result = Command::new("notify-send")
        .arg("--app-name=vstbridge")
        .arg("--")
        .arg(summary)
        .arg(body)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    if let Err(err) = result {
        debug!("could not deliver a desktop notification: {err}");
    }
}
