use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 16;

/// A typed publish/subscribe point. Publishing without subscribers is not an error.
#[derive(Debug, Clone)]
pub struct Topic<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> Topic<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(TOPIC_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn publish(&self, value: T) {
        let _ = self.tx.send(value);
    }
}

impl<T: Clone> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Notifications for UI and telemetry consumers.
#[derive(Debug, Clone, Default)]
pub struct Events {
    /// Enforced limit, signed like the last requested setpoint
    pub limit: Topic<i32>,
    /// Active power reported by the charger
    pub charger_power: Topic<i32>,
    /// Raised when no household power sample arrived in time
    pub total_power_missing: Topic<bool>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }
}
