//! MQTT pass-through metadata sink.
//!
//! No MQTT client is bundled: the bridge to an actual broker is explicitly
//! out of scope, and this core's contract ends at handing the package to
//! whatever the caller wired up. `MqttSink` wraps a plain callback so a
//! caller that does own an MQTT connection can publish from it.

use super::{MetadataPackage, MetadataSink};

/// Forwards every package to a caller-supplied closure, typically one that
/// publishes to an MQTT topic. The closure must not block: like every
/// other sink, a slow consumer should buffer on its own side rather than
/// stall the fan-out loop.
pub struct MqttSink {
    publish: Box<dyn Fn(MetadataPackage) + Send + Sync>,
}

impl MqttSink {
    pub fn new(publish: impl Fn(MetadataPackage) + Send + Sync + 'static) -> Self {
        Self { publish: Box::new(publish) }
    }
}

impl MetadataSink for MqttSink {
    fn try_enqueue(&self, pkg: MetadataPackage) -> Result<(), MetadataPackage> {
        (self.publish)(pkg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_package_reaches_the_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let sink = MqttSink::new(move |_pkg| {
            count2.fetch_add(1, Ordering::Relaxed);
        });
        sink.try_enqueue(MetadataPackage::ssnc(*b"prgr", Arc::from(&b"1/2/3"[..]))).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
