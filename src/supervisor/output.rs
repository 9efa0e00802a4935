use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 4096;

/// Incremental UTF-8 decoder for a byte stream cut at arbitrary points.
///
/// Incomplete multi-byte sequences at the end of a chunk are carried over to
/// the next one; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to() guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // truncated sequence: wait for more bytes
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is left at end of stream
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Spawn a task that reads `reader` to EOF and forwards decoded chunks to `tx`.
///
/// The task ends at EOF, on a read error, or once the receiver is gone.
pub fn forward_chunks<R>(reader: R, tx: UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut chunker = Utf8Chunker::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = chunker.decode(&buf[..n]);
                    if !text.is_empty() && tx.send(text).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!("Output stream read failed: {}", e);
                    break;
                }
            }
        }

        let rest = chunker.finish();
        if !rest.is_empty() {
            let _ = tx.send(rest);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_split_multibyte() {
        let bytes = "héllo".as_bytes();
        let mut chunker = Utf8Chunker::new();
        let first = chunker.decode(&bytes[..2]); // 'h' + first byte of 'é'
        let second = chunker.decode(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(second, "éllo");
        assert!(chunker.finish().is_empty());
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let mut chunker = Utf8Chunker::new();
        let text = chunker.decode(&[b'a', 0xff, b'b']);
        assert_eq!(text, "a\u{fffd}b");
    }

    #[test]
    fn test_dangling_prefix_flushed() {
        let mut chunker = Utf8Chunker::new();
        assert_eq!(chunker.decode(&[b'x', 0xc3]), "x");
        assert_eq!(chunker.finish(), "\u{fffd}");
    }

    #[tokio::test]
    async fn test_forward_chunks_reads_to_eof() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader: &'static [u8] = b"line one\nline two\n";
        forward_chunks(reader, tx).await.unwrap();

        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            collected.push_str(&chunk);
        }
        assert_eq!(collected, "line one\nline two\n");
    }
}
