//! Event-stream line decoder.
//!
//! Providers stream responses as newline-delimited `data: <json>` lines.
//! Network reads can split a line anywhere — including mid-codepoint — so
//! this decoder buffers raw bytes and only surfaces a payload once its full
//! line has arrived.  The decoded sequence is identical no matter how the
//! byte stream was chunked.
//!
//! The decoder deliberately does not parse the JSON payloads: delta
//! semantics are dialect-specific and belong to the provider adapters.

/// Incremental decoder from raw bytes to `data:` payload strings.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    /// Bytes of the line currently being assembled.
    buffer: Vec<u8>,

    /// Whether the `data: [DONE]` sentinel has been seen.
    done: bool,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the end-of-stream sentinel has been received.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a raw chunk, returning the payload of every line the chunk
    /// completed.
    ///
    /// Blank lines, comment lines, `event:`/other SSE fields, and the
    /// `[DONE]` sentinel are consumed here and never surfaced.  A line that
    /// is not valid UTF-8 is skipped with a warning; one corrupt line must
    /// not lose the rest of the response.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();

        for &byte in chunk {
            if byte != b'\n' {
                self.buffer.push(byte);
                continue;
            }

            let line = std::mem::take(&mut self.buffer);
            match std::str::from_utf8(&line) {
                Ok(text) => {
                    if let Some(payload) = self.decode_line(text) {
                        payloads.push(payload);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping non-UTF-8 SSE line");
                }
            }
        }

        payloads
    }

    /// Decode one complete line into its data payload, if it carries one.
    fn decode_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end_matches('\r');

        // Blank separators and SSE comments.
        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
        else {
            // `event:`, `id:`, `retry:` or anything else; the adapters key
            // off payload content, not event names.
            tracing::trace!(line, "ignoring non-data SSE line");
            return None;
        };

        let payload = payload.trim();
        if payload == "[DONE]" {
            self.done = true;
            return None;
        }

        Some(payload.to_owned())
    }
}

// ── tests ────────────────────────────────────────────────────────────
