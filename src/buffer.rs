//! Store-and-forward packet buffer.
//!
//! A fixed-capacity ring of the most recent packets. When a client session
//! registers, the router replays the whole buffer to it so phones that were
//! out of range catch up on traffic they missed.

use std::sync::Mutex;

/// Fixed-size circular buffer holding owned copies of recent packets.
/// The buffer never hands out references into its storage; callers always
/// receive fresh copies.
pub struct PacketBuffer {
    state: Mutex<RingState>,
}

struct RingState {
    slots: Vec<Option<Vec<u8>>>,
    head: usize,
    count: usize,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                slots: vec![None; capacity],
                head: 0,
                count: 0,
            }),
        }
    }

    /// Store a copy of `data` at the write head, overwriting the oldest
    /// entry once the ring is full.
    pub fn add(&self, data: &[u8]) {
        let mut state = self.state.lock().expect("packet buffer lock poisoned");

        let head = state.head;
        let capacity = state.slots.len();
        state.slots[head] = Some(data.to_vec());
        state.head = (head + 1) % capacity;
        if state.count < capacity {
            state.count += 1;
        }
    }

    /// Snapshot of the buffered packets in insertion order, oldest first.
    pub fn get_all(&self) -> Vec<Vec<u8>> {
        let state = self.state.lock().expect("packet buffer lock poisoned");

        let capacity = state.slots.len();
        let start = (state.head + capacity - state.count) % capacity;
        let mut result = Vec::with_capacity(state.count);
        for i in 0..state.count {
            if let Some(pkt) = &state.slots[(start + i) % capacity] {
                result.push(pkt.clone());
            }
        }
        result
    }

    /// Number of packets currently buffered.
    pub fn len(&self) -> usize {
        self.state.lock().expect("packet buffer lock poisoned").count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_yields_nothing() {
        let buffer = PacketBuffer::new(4);
        assert!(buffer.is_empty());
        assert!(buffer.get_all().is_empty());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let buffer = PacketBuffer::new(4);
        buffer.add(b"a");
        buffer.add(b"b");
        buffer.add(b"c");
        assert_eq!(buffer.get_all(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let buffer = PacketBuffer::new(3);
        for pkt in [b"a", b"b", b"c", b"d"] {
            buffer.add(pkt.as_slice());
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.get_all(), vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn count_caps_at_capacity() {
        let buffer = PacketBuffer::new(2);
        for i in 0..10u8 {
            buffer.add(&[i]);
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.get_all(), vec![vec![8], vec![9]]);
    }

    #[test]
    fn snapshot_is_a_defensive_copy() {
        let buffer = PacketBuffer::new(2);
        buffer.add(b"orig");
        let mut snapshot = buffer.get_all();
        snapshot[0][0] = b'X';
        assert_eq!(buffer.get_all()[0], b"orig".to_vec());
    }
}
