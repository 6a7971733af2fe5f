use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 8; // big-endian u64 payload length
pub const DEFAULT_MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: u64, max: u64 },
}

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Incremental frame decoder.
///
/// Chunks of any size can be fed as they come off the socket; complete
/// payloads are returned in order and partial bytes are kept for the next
/// call. An oversized header stops decoding for good: frames completed
/// before it are still returned, and the error is then available from
/// [`FrameDecoder::error`].
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    body_len: Option<usize>, // set once the header of the current frame is in
    max_len: u64,
    error: Option<FrameError>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: u64) -> Self {
        Self {
            buffer: Vec::new(),
            body_len: None,
            max_len,
            error: None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        if self.error.is_some() {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut pos = 0;
        loop {
            let body_len = match self.body_len {
                Some(len) => len,
                None => {
                    if self.buffer.len() - pos < HEADER_LEN {
                        break; // header still incomplete
                    }
                    let mut header = [0u8; HEADER_LEN];
                    header.copy_from_slice(&self.buffer[pos..pos + HEADER_LEN]);
                    match checked_len(u64::from_be_bytes(header), self.max_len) {
                        Ok(len) => {
                            pos += HEADER_LEN;
                            self.body_len = Some(len);
                            len
                        }
                        Err(e) => {
                            self.error = Some(e);
                            break;
                        }
                    }
                }
            };
            if self.buffer.len() - pos < body_len {
                break; // body still incomplete
            }
            frames.push(self.buffer[pos..pos + body_len].to_vec());
            pos += body_len;
            self.body_len = None;
        }

        if self.error.is_some() {
            self.buffer.clear();
        } else {
            self.buffer.drain(..pos);
        }
        frames
    }

    /// Set once an oversized header has been seen; framing is lost after it.
    pub fn error(&self) -> Option<&FrameError> {
        self.error.as_ref()
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn awaiting_body(&self) -> bool {
        self.body_len.is_some()
    }
}

fn checked_len(len: u64, max: u64) -> Result<usize, FrameError> {
    let too_large = FrameError::TooLarge { len, max };
    if len > max {
        return Err(too_large);
    }
    usize::try_from(len).map_err(|_| too_large)
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await
}

/// Reads exactly one frame, returning `None` on a clean EOF before the header.
pub async fn read_frame<R>(
    reader: &mut R,
    max_len: u64,
) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e),
    }
    let len = checked_len(u64::from_be_bytes(header), max_len)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
