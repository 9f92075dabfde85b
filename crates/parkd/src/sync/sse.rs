//! Minimal server-sent-events frame decoder.
//!
//! Only `data:` fields are kept; `event:`, `id:`, `retry:` and comment lines
//! are skipped. Multiple `data:` lines in one frame are joined with `\n`.

#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buf.extend(chunk.iter().copied().filter(|&b| b != b'\r'));
    }

    /// Next complete frame's data, if one is buffered.
    pub(crate) fn next_data(&mut self) -> Option<String> {
        loop {
            let end = self.buf.windows(2).position(|w| w == b"\n\n")?;
            let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
            let frame = String::from_utf8_lossy(&frame[..end]);

            let mut data: Option<String> = None;
            for line in frame.lines() {
                let Some(value) = line.strip_prefix("data:") else {
                    continue;
                };
                let value = value.strip_prefix(' ').unwrap_or(value);
                match data.as_mut() {
                    Some(d) => {
                        d.push('\n');
                        d.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                }
            }

            if data.is_some() {
                return data;
            }
        }
    }
}
