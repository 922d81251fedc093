//! Bounded capture of a child's output stream.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes read from one stream, cut at a ceiling.
#[derive(Debug)]
pub struct Capture {
    pub bytes: Vec<u8>,
    /// Some bytes past the ceiling were read and dropped.
    pub truncated: bool,
    limit: usize,
}

impl Capture {
    pub const fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            truncated: false,
            limit,
        }
    }

    /// Read `reader` to EOF. Bytes past the limit are read and dropped so the
    /// writer never blocks on a full pipe.
    ///
    /// Cancel safe: everything read before the future is dropped stays in
    /// `bytes`.
    pub async fn drain<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> std::io::Result<()> {
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            let room = self.limit.saturating_sub(self.bytes.len());
            if n > room {
                self.truncated = true;
            }
            self.bytes.extend_from_slice(&chunk[..n.min(room)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_everything_under_limit() {
        let mut capture = Capture::new(16);
        capture.drain(&b"hello"[..]).await.unwrap();
        assert_eq!(capture.bytes, b"hello");
        assert!(!capture.truncated);
    }

    #[tokio::test]
    async fn cuts_at_limit_and_reads_to_eof() {
        let data = vec![b'x'; 100_000];
        let mut capture = Capture::new(10);
        capture.drain(data.as_slice()).await.unwrap();
        assert_eq!(capture.bytes.len(), 10);
        assert!(capture.truncated);
    }

    #[tokio::test]
    async fn exact_limit_is_not_truncated() {
        let mut capture = Capture::new(4);
        capture.drain(&b"abcd"[..]).await.unwrap();
        assert_eq!(capture.bytes, b"abcd");
        assert!(!capture.truncated);
    }
}
