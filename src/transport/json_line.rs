//! Newline-delimited JSON filter for child stdout.
//!
//! Backend processes routinely interleave progress banners and debug chatter
//! on stdout with the JSON-RPC messages the gateway actually wants. The
//! filter reads LF-delimited lines and yields only those whose trimmed form
//! begins with `{`; everything else is dropped with a diagnostic log. A
//! JSON-looking tail left unterminated at EOF is emitted as a final line.
//!
//! The filter never merges lines: one line in, zero or one line out.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Filters an LF-delimited byte stream down to JSON-looking lines.
pub struct JsonLineFilter<R> {
    reader: R,
    done: bool,
}

impl<R: AsyncBufRead + Unpin> JsonLineFilter<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    /// Read the next JSON line, trimmed of surrounding whitespace.
    ///
    /// Returns `Ok(None)` on EOF. Whitespace-only lines are skipped silently;
    /// non-JSON lines are skipped with a log.
    pub async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if self.done {
                return Ok(None);
            }

            let mut buf = Vec::new();
            let n = self.reader.read_until(b'\n', &mut buf).await?;
            if n == 0 {
                self.done = true;
                return Ok(None);
            }

            // A line without a trailing LF is the unterminated tail at EOF.
            if buf.last() != Some(&b'\n') {
                self.done = true;
            }

            let trimmed = buf.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed[0] == b'{' {
                return Ok(Some(trimmed.to_vec()));
            }

            tracing::debug!(
                line = %String::from_utf8_lossy(trimmed),
                "ignoring non-JSON output"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &[u8]) -> Vec<Vec<u8>> {
        let mut filter = JsonLineFilter::new(input);
        let mut lines = Vec::new();
        while let Some(line) = filter.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn passes_json_lines_and_drops_noise() {
        let input = b"{\"valid\":\"json\"}\nThis is not JSON\n{\"another\":\"valid\"}\nError: something failed\n{\"third\":\"json\"}\n";
        let lines = collect(input).await;
        assert_eq!(
            lines,
            vec![
                b"{\"valid\":\"json\"}".to_vec(),
                b"{\"another\":\"valid\"}".to_vec(),
                b"{\"third\":\"json\"}".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn drops_blank_lines_silently() {
        let input = b"\n   \n{\"a\":1}\n\t\n";
        let lines = collect(input).await;
        assert_eq!(lines, vec![b"{\"a\":1}".to_vec()]);
    }

    #[tokio::test]
    async fn emits_json_tail_without_trailing_newline() {
        let input = b"{\"first\":1}\n{\"tail\":true}";
        let lines = collect(input).await;
        assert_eq!(
            lines,
            vec![b"{\"first\":1}".to_vec(), b"{\"tail\":true}".to_vec()]
        );
    }

    #[tokio::test]
    async fn drops_non_json_tail() {
        let input = b"{\"first\":1}\ntrailing banner";
        let lines = collect(input).await;
        assert_eq!(lines, vec![b"{\"first\":1}".to_vec()]);
    }

    #[tokio::test]
    async fn trims_surrounding_whitespace() {
        let input = b"  {\"padded\":1}  \r\n";
        let lines = collect(input).await;
        assert_eq!(lines, vec![b"{\"padded\":1}".to_vec()]);
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        assert!(collect(b"").await.is_empty());
    }
}
