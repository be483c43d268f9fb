//! Demo registry used by the `stencil-worker` binary

use crate::registry::{Arg, Handoff, Registry};
use anyhow::Context;
use std::io::Write;
use std::os::unix::net::UnixStream;

/// Placeholder written for descriptor arguments
pub const FD_PLACEHOLDER: &[u8] = b"<fd>";

/// Registry with the demo entry points and module
pub fn registry() -> Registry {
    Registry::new()
        .with_entry_point("echo_args", echo_args)
        .with_entry_point("echo_scope", echo_scope)
        .with_entry_point("echo_owner", echo_owner)
        .with_entry_point("relay", relay)
        .with_module("demo", |scope| {
            scope.set("demo.loaded", "yes");
            Ok(())
        })
}

/// Write every argument back on the control socket, one per line
pub fn echo_args(mut handoff: Handoff) -> anyhow::Result<()> {
    let mut out = Vec::new();
    for arg in &handoff.args {
        out.extend_from_slice(arg.as_bytes().unwrap_or(FD_PLACEHOLDER));
        out.push(b'\n');
    }
    handoff
        .control
        .write_all(&out)
        .context("writing arguments back")?;
    Ok(())
}

/// For each string argument `name`, write `name=value` from the scope
pub fn echo_scope(mut handoff: Handoff) -> anyhow::Result<()> {
    let mut out = Vec::new();
    for name in handoff.args.iter().filter_map(Arg::as_str) {
        out.extend_from_slice(name.as_bytes());
        out.push(b'=');
        out.extend_from_slice(handoff.scope.get(name).unwrap_or_default());
        out.push(b'\n');
    }
    handoff
        .control
        .write_all(&out)
        .context("writing scope back")?;
    Ok(())
}

/// Write the owner pid
pub fn echo_owner(mut handoff: Handoff) -> anyhow::Result<()> {
    write!(handoff.control, "{}", handoff.owner).context("writing owner")?;
    Ok(())
}

/// Write the concatenated string arguments into every descriptor argument
pub fn relay(handoff: Handoff) -> anyhow::Result<()> {
    let message: Vec<u8> = handoff
        .args
        .iter()
        .filter_map(Arg::as_bytes)
        .flatten()
        .copied()
        .collect();
    let mut relayed = 0;
    for fd in handoff.args.into_iter().filter_map(Arg::into_fd) {
        UnixStream::from(fd)
            .write_all(&message)
            .context("relaying to descriptor")?;
        relayed += 1;
    }
    anyhow::ensure!(relayed > 0, "relay needs at least one descriptor");
    Ok(())
}
