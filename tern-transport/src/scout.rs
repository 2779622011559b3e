//! Scouting: discover routers and peers over UDP multicast.

use crate::batch::encode_transport;
use crate::endpoint::Endpoint;
use crate::error::TransportResult;
use crate::link::{read_batch, write_batch, Link, UdpMulticastLink};
use crate::{BATCH_SIZE_DEFAULT, RX_BUFFER_SIZE};
use std::time::{Duration, Instant};
use tern_proto::core::{WhatAmI, WhatAmIMatcher, ZId};
use tern_proto::transport::TransportMessage;
use tern_proto::zint::Reader;
use tern_proto::PROTOCOL_VERSION;
use tracing::debug;

/// One Hello collected during a scouting round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloInfo {
    pub whatami: WhatAmI,
    pub zid: ZId,
    pub locators: Vec<String>,
}

/// Send a Scout on the multicast group at `endpoint` and collect Hello
/// replies until `timeout` elapses. Stops early once `stop` says so (used
/// by `open` to take the first router).
pub fn scout(
    endpoint: &Endpoint,
    what: WhatAmIMatcher,
    zid: ZId,
    timeout: Duration,
    mut stop: impl FnMut(&[HelloInfo]) -> bool,
) -> TransportResult<Vec<HelloInfo>> {
    let link = UdpMulticastLink::open(endpoint)?;
    let scout = TransportMessage::Scout {
        version: PROTOCOL_VERSION,
        what,
        zid: Some(zid),
    };
    write_batch(&link, &encode_transport(&scout, BATCH_SIZE_DEFAULT)?)?;

    let deadline = Instant::now() + timeout;
    let mut hellos: Vec<HelloInfo> = Vec::new();
    let mut buf = vec![0u8; RX_BUFFER_SIZE];
    loop {
        let now = Instant::now();
        if now >= deadline || stop(&hellos) {
            break;
        }
        link.set_read_timeout(Some(deadline - now))?;
        let (n, _) = match read_batch(&link, &mut buf) {
            Ok(out) => out,
            Err(e) if e.is_timeout() => break,
            Err(e) => return Err(e),
        };
        let mut r = Reader::new(&buf[..n]);
        while !r.is_empty() {
            match TransportMessage::decode(&mut r) {
                Ok(TransportMessage::Hello {
                    whatami,
                    zid: hello_zid,
                    locators,
                    ..
                }) => {
                    if !what.matches(whatami) {
                        continue;
                    }
                    if hellos.iter().any(|h| h.zid == hello_zid) {
                        continue;
                    }
                    debug!(%whatami, zid = %hello_zid, "scouting hello");
                    hellos.push(HelloInfo {
                        whatami,
                        zid: hello_zid,
                        locators,
                    });
                }
                // Our own Scout loops back; anything undecodable is noise.
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }
    link.close()?;
    Ok(hellos)
}
