//! Pre-flight checks on URLs and command-line options
//!
//! Some git transport helpers (`ext::`, `fd::`) and some options
//! (`--upload-pack`, `--receive-pack`, `--exec`) let a URL or an option value
//! smuggle an arbitrary command into the invoked process. These checks run
//! before any subprocess is spawned; nothing is executed on rejection.

use tracing::warn;

use crate::error::{RemoraError, Result};

/// Transport schemes that can run arbitrary local commands or open raw
/// file descriptors. Matched case-sensitively against the exact prefix
/// before `::` or `://`.
const UNSAFE_PROTOCOLS: &[&str] = &["ext", "fd"];

/// Option names that git forwards verbatim to a remote-invoked helper
/// program. Matched after stripping leading dashes and any `=value` suffix.
const UNSAFE_OPTIONS: &[&str] = &["upload-pack", "receive-pack", "exec"];

/// Extract the transport scheme of a URL, if it has one.
fn protocol_of(url: &str) -> Option<&str> {
    if let Some(idx) = url.find("://") {
        return Some(&url[..idx]);
    }
    // Helper syntax: `<transport>::<address>`.
    url.split_once("::").map(|(proto, _)| proto)
}

/// Reject a URL whose transport scheme is deny-listed.
///
/// With `allow_unsafe` the check still runs and logs, but never fails.
pub fn check_protocol(url: &str, allow_unsafe: bool) -> Result<()> {
    let Some(proto) = protocol_of(url) else {
        return Ok(());
    };
    if !UNSAFE_PROTOCOLS.contains(&proto) {
        return Ok(());
    }
    if allow_unsafe {
        warn!(url, protocol = proto, "allowing unsafe protocol");
        return Ok(());
    }
    Err(RemoraError::UnsafeProtocol(proto.to_string()))
}

/// Reject any option whose name is deny-listed.
///
/// Options may appear as `name`, `--name` or `--name=value`.
/// With `allow_unsafe` the check still runs and logs, but never fails.
pub fn check_options<I, S>(options: I, allow_unsafe: bool) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for option in options {
        let option = option.as_ref();
        let name = option
            .trim_start_matches('-')
            .split('=')
            .next()
            .unwrap_or_default();
        if !UNSAFE_OPTIONS.contains(&name) {
            continue;
        }
        if allow_unsafe {
            warn!(option, "allowing unsafe option");
            continue;
        }
        return Err(RemoraError::UnsafeOption(name.to_string()));
    }
    Ok(())
}
