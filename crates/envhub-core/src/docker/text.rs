//! Frame-to-text decoding for followed container output.
//!
//! Docker splits output at arbitrary byte boundaries, so a multi-byte
//! character can straddle two frames. The incomplete tail of each frame is
//! held back until the next one arrives.

use bollard::container::LogOutput;

/// Length of a trailing, not yet complete UTF-8 sequence in `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0.. => 4,
            0xE0.. => 3,
            0xC0.. => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        text
    }

    fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Decodes container output frames, one carry per output stream.
#[derive(Debug, Default)]
pub struct LogText {
    stdout: Utf8Carry,
    stderr: Utf8Carry,
}

impl LogText {
    /// Text completed by `frame`; may be empty.
    pub fn push(&mut self, frame: LogOutput) -> String {
        match frame {
            LogOutput::StdErr { message } => self.stderr.push(&message),
            LogOutput::StdOut { message }
            | LogOutput::Console { message }
            | LogOutput::StdIn { message } => self.stdout.push(&message),
        }
    }

    /// Whatever is still held back once the stream has ended.
    pub fn finish(&mut self) -> String {
        let mut rest = self.stdout.finish();
        rest.push_str(&self.stderr.finish());
        rest
    }
}
