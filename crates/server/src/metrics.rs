use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    messages_stored: AtomicU64,
    pushes_dispatched: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::SeqCst)
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_stored(&self) {
        self.messages_stored.fetch_add(1, Ordering::SeqCst);
    }

    pub fn messages_stored(&self) -> u64 {
        self.messages_stored.load(Ordering::SeqCst)
    }

    pub fn mark_push(&self) {
        self.pushes_dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE sotto_connections_active gauge\nsotto_connections_active {}\n# TYPE sotto_frames_ingress counter\nsotto_frames_ingress {}\n# TYPE sotto_frames_egress counter\nsotto_frames_egress {}\n# TYPE sotto_messages_stored counter\nsotto_messages_stored {}\n# TYPE sotto_pushes_dispatched counter\nsotto_pushes_dispatched {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.frames_ingress.load(Ordering::SeqCst),
            self.frames_egress.load(Ordering::SeqCst),
            self.messages_stored.load(Ordering::SeqCst),
            self.pushes_dispatched.load(Ordering::SeqCst)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move_and_encode() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.mark_ingress();
        metrics.mark_stored();
        assert_eq!(metrics.connections_active(), 1);
        metrics.decr_connections();
        assert_eq!(metrics.connections_active(), 0);
        let encoded = metrics.encode_prometheus();
        assert!(encoded.contains("sotto_frames_ingress 1"));
        assert!(encoded.contains("sotto_messages_stored 1"));
    }
}
