use std::time::Duration;

use tokio::sync::watch;

/// Opens the readiness barrier. Dropping it without opening leaves the barrier
/// closed for good.
#[derive(Debug)]
pub struct ReadinessGate {
    sender: watch::Sender<bool>,
}

/// Cheap, cloneable view on the readiness barrier.
#[derive(Debug, Clone)]
pub struct Readiness {
    receiver: watch::Receiver<bool>,
}

pub fn readiness() -> (ReadinessGate, Readiness) {
    let (sender, receiver) = watch::channel(false);
    (ReadinessGate { sender }, Readiness { receiver })
}

impl ReadinessGate {
    pub fn open(&self) {
        self.sender.send_replace(true);
    }

    /// Opens the barrier once `settle_delay` has passed, giving notifications
    /// caused by initialisation time to drain.
    pub fn open_after(self, settle_delay: Duration) {
        tokio::spawn(async move {
            if !settle_delay.is_zero() {
                tokio::time::sleep(settle_delay).await;
            }
            self.open();
            tracing::debug!("readiness barrier opened after {settle_delay:?}");
        });
    }
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Waits until the barrier opens. Returns false if the gate was dropped
    /// while still closed.
    pub async fn wait(&mut self) -> bool {
        self.receiver.wait_for(|ready| *ready).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_barrier_starts_closed() {
        let (gate, readiness) = readiness();
        assert!(!readiness.is_ready());
        gate.open();
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_open_after_delay() {
        let (gate, mut readiness) = readiness();
        gate.open_after(Duration::from_millis(20));
        assert!(!readiness.is_ready());

        let opened = tokio::time::timeout(Duration::from_millis(500), readiness.wait())
            .await
            .expect("barrier should open");
        assert!(opened);
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_dropped_gate_never_opens() {
        let (gate, mut readiness) = readiness();
        drop(gate);
        assert!(!readiness.wait().await);
        assert!(!readiness.is_ready());
    }
}
