use futures::StreamExt;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::error::FrameError;

/// LF-delimited lines of bounded length over a byte stream.
///
/// `LinesCodec` does the buffering and strips a trailing CR. Its limit
/// counts the CR, so the codec gets one extra byte and the limit on the
/// stripped line is enforced here.
pub struct Framer<R> {
    inner: FramedRead<R, LinesCodec>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> Framer<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        let codec = LinesCodec::new_with_max_length(max_len.saturating_add(1));
        Self {
            inner: FramedRead::new(inner, codec),
            max_len,
        }
    }

    /// Next line, `Ok(None)` once the peer has closed. An unterminated tail
    /// at end of stream is yielded as a final line. Cancel safe.
    pub async fn next_line(&mut self) -> Result<Option<String>, FrameError> {
        let limit = self.max_len;

        match self.inner.next().await {
            None => Ok(None),
            Some(Ok(line)) if line.len() > limit => Err(FrameError::LineTooLong { limit }),
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(FrameError::LineTooLong { limit }),
            Some(Err(LinesCodecError::Io(err))) if err.kind() == io::ErrorKind::InvalidData => {
                Err(FrameError::InvalidUtf8)
            }
            Some(Err(LinesCodecError::Io(err))) => Err(FrameError::Transport(err)),
        }
    }
}
