//! Per-key coalescing of events within a time window.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::handler::Debounce;
use super::{Delivery, DispatchEvent};

struct Pending {
    generation: u64,
    deliveries: Vec<Delivery>,
    timer: JoinHandle<()>,
}

pub struct Debouncer {
    pending: HashMap<String, Pending>,
    next_generation: u64,
    events: mpsc::UnboundedSender<DispatchEvent>,
}

impl Debouncer {
    pub fn new(events: mpsc::UnboundedSender<DispatchEvent>) -> Self {
        Self {
            pending: HashMap::new(),
            next_generation: 0,
            events,
        }
    }

    /// Hold `delivery` under `key` and restart the window.
    ///
    /// Returns the deliveries discarded by a `discard` debounce; the caller
    /// completes them without running the handler.
    pub fn submit(&mut self, key: String, delivery: Delivery, debounce: &Debounce) -> Vec<Delivery> {
        let (mut held, discarded) = match self.pending.remove(&key) {
            Some(previous) => {
                previous.timer.abort();
                if debounce.discard {
                    (Vec::new(), previous.deliveries)
                } else {
                    (previous.deliveries, Vec::new())
                }
            }
            None => (Vec::new(), Vec::new()),
        };
        held.push(delivery);

        self.next_generation += 1;
        let generation = self.next_generation;
        let events = self.events.clone();
        let window = debounce.window;
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = events.send(DispatchEvent::DebounceElapsed {
                key: timer_key,
                generation,
            });
        });

        debug!(key = %key, held = held.len(), discarded = discarded.len(), "Debounced event");
        self.pending.insert(
            key,
            Pending {
                generation,
                deliveries: held,
                timer,
            },
        );
        discarded
    }

    /// Release everything held under `key` if the timer is still current.
    pub fn elapsed(&mut self, key: &str, generation: u64) -> Vec<Delivery> {
        match self.pending.get(key) {
            Some(pending) if pending.generation == generation => self
                .pending
                .remove(key)
                .map(|p| p.deliveries)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub fn held(&self) -> usize {
        self.pending.values().map(|p| p.deliveries.len()).sum()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        for pending in self.pending.values() {
            pending.timer.abort();
        }
    }
}
