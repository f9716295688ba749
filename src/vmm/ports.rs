//! Console/monitor port allocation.
//!
//! QEMU binds both TCP servers itself, so the allocator only probes: bind,
//! release, remember. The first two ports that bind become the pair.

use std::net::{Ipv4Addr, TcpListener};
use std::ops::Range;

use tracing::{debug, trace};

use crate::{Error, Result};

/// Default port scan range (half-open).
pub const DEFAULT_PORT_RANGE: Range<u16> = 50000..60000;

/// The two ports a session binds its VM channels to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    /// Serial console TCP server port
    pub console: u16,
    /// QEMU monitor TCP server port
    pub monitor: u16,
}

/// Find two distinct free ports on 127.0.0.1 within `range`.
pub fn allocate_port_pair(range: Range<u16>) -> Result<PortPair> {
    let mut found = Vec::with_capacity(2);

    for port in range.clone() {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => {
                drop(listener);
                found.push(port);
                if found.len() == 2 {
                    let pair = PortPair {
                        console: found[0],
                        monitor: found[1],
                    };
                    debug!(console = pair.console, monitor = pair.monitor, "allocated ports");
                    return Ok(pair);
                }
            }
            Err(e) => trace!(port, error = %e, "port busy"),
        }
    }

    Err(Error::PortExhausted {
        start: range.start,
        end: range.end,
    })
}
