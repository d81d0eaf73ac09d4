//! Lazy one-time platform validation.
//!
//! Runs at first kqueue creation. The only check today is whether a peer
//! close is observable as "readable with a zero-byte peek" on a stream
//! socket, the technique the read filter falls back to where the hang-up
//! readiness bit is unreliable. The verdict is probed on a disposable
//! socket pair and cached for the process lifetime.
//!
//! Nothing process-global is installed here; signal masks change only
//! when signal knotes are added.

use std::sync::OnceLock;

/// Cached platform capabilities.
pub(crate) struct PlatformCaps {
    /// Whether the zero-byte `MSG_PEEK` reliably reports a closed peer.
    pub(crate) peek_detects_close: bool,
}

static CAPS: OnceLock<PlatformCaps> = OnceLock::new();

/// Returns the validated capabilities, probing on first use.
pub(crate) fn platform_caps() -> &'static PlatformCaps {
    CAPS.get_or_init(|| {
        let caps = PlatformCaps {
            peek_detects_close: probe_peer_close(),
        };
        log::debug!(
            "platform init: peek close detection {}",
            if caps.peek_detects_close {
                "validated"
            } else {
                "unavailable"
            }
        );
        caps
    })
}

/// Probes peer-close detection on a disposable socket pair.
#[cfg(unix)]
fn probe_peer_close() -> bool {
    use crate::sys;

    let Ok((local, peer)) = sys::sys_socketpair() else {
        return false;
    };

    // Nothing was written, so any readability before the close would be
    // noise and the technique cannot be trusted.
    if sys::sys_poll_readable(sys::raw(&local), 0) {
        return false;
    }

    drop(peer);

    sys::sys_poll_readable(sys::raw(&local), 0) && sys::sys_peek_eof(sys::raw(&local))
}

#[cfg(not(unix))]
fn probe_peer_close() -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn peer_close_is_detectable_on_this_platform() {
        assert!(platform_caps().peek_detects_close);
    }
}
