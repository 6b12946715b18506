use heapless::Deque;

/// Bounded FIFO of bytes already pulled off the module.
///
/// Writers never block: whatever does not fit is refused and left for the
/// caller to drop.
#[derive(Debug)]
pub struct RxBuffer<const N: usize> {
    storage: Deque<u8, N>,
}

impl<const N: usize> Default for RxBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RxBuffer<N> {
    pub const fn new() -> Self {
        Self {
            storage: Deque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.storage.is_full()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of bytes that can still be enqueued.
    pub fn window(&self) -> usize {
        N - self.storage.len()
    }

    pub fn clear(&mut self) {
        self.storage.clear();
    }

    /// Enqueue as much of `data` as fits, returning the accepted length.
    pub fn enqueue_slice(&mut self, data: &[u8]) -> usize {
        let accepted = data.len().min(self.window());
        for &byte in &data[..accepted] {
            // Cannot fail, `accepted` is bounded by the window.
            let _ = self.storage.push_back(byte);
        }
        accepted
    }

    /// Dequeue into `data`, returning the number of bytes written.
    pub fn dequeue_slice(&mut self, data: &mut [u8]) -> usize {
        let mut count = 0;
        for slot in data.iter_mut() {
            match self.storage.pop_front() {
                Some(byte) => {
                    *slot = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}
