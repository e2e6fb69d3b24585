use std::sync::Mutex;

const TAIL_LINE_MAX_BYTES: usize = 220;

/// Tail of a worker's combined stdout/stderr, capped at `max` bytes.
///
/// Raw bytes only: writes append and the front is dropped once the cap is
/// exceeded, so line boundaries are not preserved.
#[derive(Debug)]
pub struct RingBuffer {
    max: usize,
    data: Mutex<Vec<u8>>,
}

impl RingBuffer {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            data: Mutex::new(Vec::with_capacity(max.min(64 * 1024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn write(&self, bytes: &[u8]) {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if bytes.len() >= self.max {
            data.clear();
            data.extend_from_slice(&bytes[bytes.len() - self.max..]);
            return;
        }
        data.extend_from_slice(bytes);
        if data.len() > self.max {
            let excess = data.len() - self.max;
            data.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent bytes, lossily decoded.
    pub fn contents(&self) -> String {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&data).into_owned()
    }
}

impl std::io::Write for &RingBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        RingBuffer::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Last non-empty line of captured output, trimmed to its final bytes.
pub fn tail_line(logs: &str) -> String {
    let Some(line) = logs
        .trim()
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
    else {
        return String::new();
    };

    if line.len() <= TAIL_LINE_MAX_BYTES {
        return line.to_string();
    }
    let mut start = line.len() - TAIL_LINE_MAX_BYTES;
    while !line.is_char_boundary(start) {
        start += 1;
    }
    line[start..].to_string()
}
