use std::{collections::BTreeSet, sync::Arc};

use parking_lot::Mutex;

use super::SandboxError;

/// Hands out host ports for sandboxes. Allocation is serialized; a port is
/// held by a [`PortLease`] from the moment it is chosen until the caller
/// records it (or gives up).
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    max: u16,
    gate: tokio::sync::Mutex<()>,
    in_flight: Arc<Mutex<BTreeSet<u16>>>,
}

#[derive(Debug)]
pub struct PortLease {
    port: u16,
    in_flight: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.port);
    }
}

impl PortAllocator {
    pub fn new(base: u16, max: u16) -> Self {
        Self {
            base,
            max,
            gate: tokio::sync::Mutex::new(()),
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Picks the lowest port in range not returned by `in_use` and not
    /// leased to another in-flight provisioning.
    pub async fn allocate<F>(&self, in_use: F) -> Result<PortLease, SandboxError>
    where
        F: FnOnce() -> BTreeSet<u16>,
    {
        let _gate = self.gate.lock().await;
        let taken = in_use();
        let mut in_flight = self.in_flight.lock();

        let port = (self.base..=self.max)
            .find(|port| !taken.contains(port) && !in_flight.contains(port))
            .ok_or(SandboxError::PortsExhausted {
                base: self.base,
                max: self.max,
            })?;
        in_flight.insert(port);

        Ok(PortLease {
            port,
            in_flight: Arc::clone(&self.in_flight),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn skips_ports_in_use_and_leased() {
        let allocator = PortAllocator::new(9100, 9103);
        let first = allocator
            .allocate(|| BTreeSet::from([9100]))
            .await
            .expect("first");
        assert_eq!(first.port(), 9101);

        let second = allocator
            .allocate(|| BTreeSet::from([9100]))
            .await
            .expect("second");
        assert_eq!(second.port(), 9102);

        drop(first);
        let third = allocator
            .allocate(|| BTreeSet::from([9100]))
            .await
            .expect("third");
        assert_eq!(third.port(), 9101);
    }

    #[tokio::test]
    async fn exhaustion_is_reported() {
        let allocator = PortAllocator::new(9100, 9100);
        let _held = allocator.allocate(BTreeSet::new).await.expect("only port");
        let error = allocator
            .allocate(BTreeSet::new)
            .await
            .expect_err("range exhausted");
        assert!(matches!(
            error,
            SandboxError::PortsExhausted { base: 9100, max: 9100 }
        ));
    }
}
