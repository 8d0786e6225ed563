/// Size of the output kept for error reports
pub const MAX_BUF_SIZE: usize = 8 * 1024;

/// Circular byte buffer keeping the most recent `capacity` bytes written.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: Vec<u8>,
    capacity: usize,
    // Next write position once the buffer has wrapped
    start: usize,
    total: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity.min(MAX_BUF_SIZE)),
            capacity,
            start: 0,
            total: 0,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.total += bytes.len();
        if self.capacity == 0 {
            return;
        }
        // Only the tail of an oversized write can survive
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        for &byte in bytes {
            if self.data.len() < self.capacity {
                self.data.push(byte);
            } else {
                self.data[self.start] = byte;
                self.start = (self.start + 1) % self.capacity;
            }
        }
    }

    /// Append a line and its terminating newline.
    pub fn push_line(&mut self, line: &str) {
        self.write(line.as_bytes());
        self.write(b"\n");
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total bytes ever written, including the ones dropped.
    pub fn total_written(&self) -> usize {
        self.total
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(&self.data[self.start..]);
        out.extend_from_slice(&self.data[..self.start]);
        out
    }
}

impl std::fmt::Display for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.bytes()))
    }
}
