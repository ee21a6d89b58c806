//! In-memory pipe for testing without a real transport.

use std::collections::VecDeque;

use matic_core::constants::DEFAULT_BUFFER_SIZE;
use matic_core::{Pipe, Result};

/// A pipe backed by two frame queues.
///
/// Frames pushed with [`MockPipe::push_inbound`] are what the manager
/// reads; frames the manager writes land in the outbound queue and are
/// drained with [`MockPipe::take_written`].
#[derive(Debug)]
pub struct MockPipe {
    inbound: VecDeque<Vec<u8>>,
    written: VecDeque<Vec<u8>>,
    swap: bool,
    read_size: usize,
    write_size: usize,
}

impl MockPipe {
    pub fn new() -> MockPipe {
        MockPipe {
            inbound: VecDeque::new(),
            written: VecDeque::new(),
            swap: false,
            read_size: DEFAULT_BUFFER_SIZE,
            write_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Simulate a peer with the opposite byte order.
    pub fn with_swap(mut self) -> MockPipe {
        self.swap = true;
        self
    }

    /// Shrink the negotiated buffer sizes, e.g. to force chunked writes.
    pub fn with_buffer_sizes(mut self, read: usize, write: usize) -> MockPipe {
        self.read_size = read;
        self.write_size = write;
        self
    }

    /// Queue a frame for the manager to read.
    pub fn push_inbound(&mut self, frame: Vec<u8>) {
        self.inbound.push_back(frame);
    }

    /// Pop the oldest frame the manager wrote.
    pub fn take_written(&mut self) -> Option<Vec<u8>> {
        self.written.pop_front()
    }

    pub fn written_len(&self) -> usize {
        self.written.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }
}

impl Default for MockPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for MockPipe {
    fn read_buffer_size(&self) -> usize {
        self.read_size
    }

    fn write_buffer_size(&self) -> usize {
        self.write_size
    }

    fn read_data_copy(&mut self) -> Vec<u8> {
        self.inbound.pop_front().unwrap_or_default()
    }

    fn write_data_copy(&mut self, data: &[u8]) -> Result<()> {
        self.written.push_back(data.to_vec());
        Ok(())
    }

    fn is_byte_swap_needed(&self) -> bool {
        self.swap
    }
}
