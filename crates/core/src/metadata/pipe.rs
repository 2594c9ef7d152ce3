//! Named-pipe (FIFO) metadata sink.
//!
//! Opened lazily: the FIFO is not opened for writing until the first item
//! needs to go out. A blocking `open()` on a FIFO with no reader attached
//! would stall this sink's consumer thread indefinitely, so the open is
//! `O_NONBLOCK`, turning the "no reader yet" case into an `ENXIO` the
//! consumer tolerates and retries on the next item instead of a hang.

use std::io::Write;
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl, open};
use nix::sys::stat::Mode;

use crate::crypto::base64_encode;
use crate::queue::BoundedQueue;

use super::{MetadataPackage, MetadataSink};

const CONSUMER_POLL: Duration = Duration::from_millis(200);

/// Base64 lines are wrapped at this width inside the `<data>` element.
const BASE64_LINE_WIDTH: usize = 76;

fn hex4(code: &[u8; 4]) -> String {
    code.iter().map(|b| format!("{b:02x}")).collect()
}

/// Split a base64 string into `BASE64_LINE_WIDTH`-character lines.
fn wrap_base64(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_WIDTH + 1);
    for chunk in encoded.as_bytes().chunks(BASE64_LINE_WIDTH) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 alphabet is ASCII"));
        out.push('\n');
    }
    out
}

/// Frame one package as the XML+base64 record written to the pipe (design
/// §6 metadata pipe format): `<type>`/`<code>` as hex, base64 payload
/// wrapped into 76-character lines.
fn frame(pkg: &MetadataPackage) -> String {
    format!(
        "<item><type>{}</type><code>{}</code><length>{}</length>\n<data encoding=\"base64\">\n{}</data></item>\n",
        hex4(&pkg.msg_type),
        hex4(&pkg.code),
        pkg.payload.len(),
        wrap_base64(&base64_encode(&pkg.payload)),
    )
}

/// Open `path` for writing without blocking when no reader is attached
/// (`ENXIO` from the kernel in that case, matching design §4.4's "readers
/// may come and go" note), then drop back to blocking mode for the
/// writes themselves so a short write doesn't race a half-attached reader.
fn open_for_writer(path: &std::path::Path) -> Result<std::fs::File, Errno> {
    let fd = open(path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty())?;
    fcntl(fd, FcntlArg::F_SETFL(OFlag::empty()))?;
    // SAFETY: `open` returned a freshly owned fd; `File` takes ownership.
    let file = unsafe { std::fs::File::from_raw_fd(fd) };
    Ok(file)
}

/// Metadata sink that writes framed XML records to a named pipe.
pub struct PipeSink {
    queue: Arc<BoundedQueue<MetadataPackage>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PipeSink {
    /// Create the FIFO at `path` if it does not already exist, and spawn
    /// the consumer thread that lazily opens it and drains the queue.
    pub fn new(path: impl Into<PathBuf>) -> crate::error::Result<Self> {
        let path = path.into();
        if !path.exists() {
            nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600))
                .map_err(|e| crate::error::RtspError::ResourceExhausted(format!("mkfifo {path:?}: {e}")))?;
        }

        let queue = Arc::new(BoundedQueue::new(crate::queue::DEFAULT_CAPACITY));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let queue = queue.clone();
            let stop = stop.clone();
            std::thread::spawn(move || Self::consume(path, queue, stop))
        };

        Ok(Self { queue, stop, worker: Some(worker) })
    }

    fn consume(path: PathBuf, queue: Arc<BoundedQueue<MetadataPackage>>, stop: Arc<AtomicBool>) {
        let mut handle: Option<std::fs::File> = None;
        while let Some(pkg) = queue.get_item_cancelable(&stop, CONSUMER_POLL) {
            let file = match handle.as_mut() {
                Some(f) => f,
                None => match open_for_writer(&path) {
                    Ok(f) => handle.insert(f),
                    Err(Errno::ENXIO) => {
                        tracing::debug!(?path, "no reader attached to metadata pipe, dropping item");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "failed to open metadata pipe, dropping item");
                        continue;
                    }
                },
            };
            if let Err(e) = file.write_all(frame(&pkg).as_bytes()) {
                tracing::warn!(?path, error = %e, "metadata pipe write failed, will reopen");
                handle = None;
            }
        }
    }
}

impl MetadataSink for PipeSink {
    fn try_enqueue(&self, pkg: MetadataPackage) -> Result<(), MetadataPackage> {
        self.queue.add_item(pkg, false)
    }
}

impl Drop for PipeSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_contains_hex_type_code_and_base64_data() {
        let pkg = MetadataPackage::ssnc(*b"prgr", Arc::from(&b"1/2/3"[..]));
        let framed = frame(&pkg);
        assert!(framed.starts_with("<item><type>73736e63</type><code>70726772</code>"));
        assert!(framed.contains("<length>5</length>"));
        assert!(framed.contains(&base64_encode(b"1/2/3")));
        assert!(framed.ends_with("</item>\n"));
    }

    #[test]
    fn long_payload_wraps_base64_at_76_chars() {
        let payload = vec![0x41u8; 200];
        let pkg = MetadataPackage::core(*b"asal", Arc::from(payload.as_slice()));
        let framed = frame(&pkg);
        let data_lines: Vec<&str> = framed
            .split("<data encoding=\"base64\">\n")
            .nth(1)
            .unwrap()
            .split("</data>")
            .next()
            .unwrap()
            .lines()
            .collect();
        assert!(data_lines.iter().take(data_lines.len() - 1).all(|l| l.len() == 76));
    }

    #[test]
    fn creates_fifo_and_accepts_items_without_a_reader() {
        let dir = std::env::temp_dir().join(format!("raop-pipe-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("metadata-pipe");
        let sink = PipeSink::new(&path).unwrap();
        assert!(path.exists());
        // No reader attached: enqueue must not block the caller.
        let pkg = MetadataPackage::ssnc(*b"mdst", Arc::from(&b""[..]));
        assert!(sink.try_enqueue(pkg).is_ok());
        drop(sink);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
