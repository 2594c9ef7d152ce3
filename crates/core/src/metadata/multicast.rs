//! UDP multicast metadata sink.
//!
//! A small package goes out as one datagram: `type(4) || code(4) ||
//! payload`. A payload that would not fit in a single datagram is split
//! into the chunking protocol instead: `"ssnc" || "chnk" || chunk_ix(4,
//! BE) || chunk_total(4, BE) || type(4) || code(4) || payload_slice`, so a
//! listener can reassemble `PICT` (album art) payloads that routinely
//! exceed the MTU. All multi-byte integers are big-endian.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::queue::BoundedQueue;

use super::{MetadataPackage, MetadataSink};

const CONSUMER_POLL: Duration = Duration::from_millis(200);
/// `sockmsglength`: the datagram payload budget this sink
/// targets, leaving room under a conservative 1500-byte Ethernet MTU once
/// IP/UDP headers are accounted for.
const SOCK_MSG_LENGTH: usize = 1472;
/// Small-package threshold: `type(4) + code(4)` overhead.
const SMALL_HEADER: usize = 8;
/// Chunked-package overhead: `"ssnc"(4) + "chnk"(4) + chunk_ix(4) +
/// chunk_total(4) + type(4) + code(4)`.
const CHUNK_HEADER: usize = 24;

/// Build the datagram(s) for one package: a single `type||code||payload`
/// datagram when it fits, otherwise the `ssncchnk`-framed chunk sequence.
fn build_datagrams(pkg: &MetadataPackage) -> Vec<Vec<u8>> {
    if pkg.payload.len() <= SOCK_MSG_LENGTH - SMALL_HEADER {
        let mut datagram = Vec::with_capacity(SMALL_HEADER + pkg.payload.len());
        datagram.extend_from_slice(&pkg.msg_type);
        datagram.extend_from_slice(&pkg.code);
        datagram.extend_from_slice(&pkg.payload);
        return vec![datagram];
    }

    let chunk_payload_budget = SOCK_MSG_LENGTH - CHUNK_HEADER;
    let chunk_total = pkg.payload.len().div_ceil(chunk_payload_budget);
    pkg.payload
        .chunks(chunk_payload_budget)
        .enumerate()
        .map(|(chunk_ix, slice)| {
            let mut datagram = Vec::with_capacity(CHUNK_HEADER + slice.len());
            datagram.extend_from_slice(b"ssnc");
            datagram.extend_from_slice(b"chnk");
            datagram.extend_from_slice(&(chunk_ix as u32).to_be_bytes());
            datagram.extend_from_slice(&(chunk_total as u32).to_be_bytes());
            datagram.extend_from_slice(&pkg.msg_type);
            datagram.extend_from_slice(&pkg.code);
            datagram.extend_from_slice(slice);
            datagram
        })
        .collect()
}

/// Metadata sink that fans packages out as UDP datagrams to a multicast
/// group.
pub struct MulticastSink {
    queue: Arc<BoundedQueue<MetadataPackage>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MulticastSink {
    pub fn new(target: std::net::SocketAddr) -> crate::error::Result<Self> {
        let bind_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(target)?;

        let queue = Arc::new(BoundedQueue::new(crate::queue::DEFAULT_CAPACITY));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let queue = queue.clone();
            let stop = stop.clone();
            std::thread::spawn(move || Self::consume(socket, queue, stop))
        };

        Ok(Self { queue, stop, worker: Some(worker) })
    }

    fn consume(socket: UdpSocket, queue: Arc<BoundedQueue<MetadataPackage>>, stop: Arc<AtomicBool>) {
        while let Some(pkg) = queue.get_item_cancelable(&stop, CONSUMER_POLL) {
            for datagram in build_datagrams(&pkg) {
                if let Err(e) = socket.send(&datagram) {
                    tracing::warn!(error = %e, "multicast metadata send failed");
                }
            }
        }
    }
}

impl MetadataSink for MulticastSink {
    fn try_enqueue(&self, pkg: MetadataPackage) -> Result<(), MetadataPackage> {
        self.queue.add_item(pkg, false)
    }
}

impl Drop for MulticastSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
