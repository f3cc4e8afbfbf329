//! Shared timer wheel.
//!
//! One scheduler task serves every time-driven order event in the process:
//! TWAP/VWAP slice releases and DAY-session expiries. Fired events are
//! handed to a dispatch channel; the engine routes them to the owning
//! pair's single-writer task.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use uuid::Uuid;

use crate::models::order::now_millis;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WheelEvent {
    ReleaseSlice { pair: String, parent_id: Uuid },
    ExpireOrder { pair: String, order_id: Uuid },
}

impl WheelEvent {
    pub fn pair(&self) -> &str {
        match self {
            WheelEvent::ReleaseSlice { pair, .. } => pair,
            WheelEvent::ExpireOrder { pair, .. } => pair,
        }
    }
}

#[derive(Debug)]
struct Entry {
    at_ms: i64,
    seq: u64,
    event: WheelEvent,
}

// Min-heap on (at_ms, seq); the event itself does not participate.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at_ms, other.seq).cmp(&(self.at_ms, self.seq))
    }
}

#[derive(Clone)]
pub struct WheelHandle {
    tx: mpsc::UnboundedSender<(i64, WheelEvent)>,
}

impl WheelHandle {
    pub fn schedule_at(&self, at_ms: i64, event: WheelEvent) {
        let _ = self.tx.send((at_ms, event));
    }

    pub fn schedule_in(&self, delay_ms: i64, event: WheelEvent) {
        self.schedule_at(now_millis() + delay_ms.max(0), event);
    }
}

/// Start the wheel; fired events appear on the returned receiver in due
/// order.
pub fn start() -> (WheelHandle, mpsc::UnboundedReceiver<WheelEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(i64, WheelEvent)>();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WheelEvent>();

    tokio::spawn(async move {
        let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
        let mut seq: u64 = 0;

        loop {
            let next_due = heap.peek().map(|e| e.at_ms);
            let deadline = next_due.map(|at| {
                let delta = (at - now_millis()).max(0) as u64;
                Instant::now() + Duration::from_millis(delta)
            });

            tokio::select! {
                scheduled = rx.recv() => {
                    match scheduled {
                        Some((at_ms, event)) => {
                            seq += 1;
                            heap.push(Entry { at_ms, seq, event });
                        }
                        None => break,
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let now = now_millis();
                    while heap.peek().map_or(false, |e| e.at_ms <= now) {
                        let Some(entry) = heap.pop() else { break };
                        if out_tx.send(entry.event).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    (WheelHandle { tx }, out_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_in_due_order() {
        let (handle, mut fired) = start();
        let base = now_millis();
        let late = WheelEvent::ExpireOrder {
            pair: "XOM/USDT".into(),
            order_id: Uuid::new_v4(),
        };
        let early = WheelEvent::ReleaseSlice {
            pair: "XOM/USDT".into(),
            parent_id: Uuid::new_v4(),
        };
        handle.schedule_at(base + 40, late.clone());
        handle.schedule_at(base + 10, early.clone());

        let first = fired.recv().await.unwrap();
        let second = fired.recv().await.unwrap();
        assert_eq!(first, early);
        assert_eq!(second, late);
    }

    #[tokio::test]
    async fn past_deadlines_fire_immediately() {
        let (handle, mut fired) = start();
        let event = WheelEvent::ExpireOrder {
            pair: "XOM/USDT".into(),
            order_id: Uuid::new_v4(),
        };
        handle.schedule_at(now_millis() - 1000, event.clone());
        assert_eq!(fired.recv().await.unwrap(), event);
    }
}
