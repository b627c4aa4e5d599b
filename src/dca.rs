//! DCA clip files: a flat run of `[i16 LE length][payload]` records, one
//! pre-encoded Opus frame per record.

use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DcaError {
    #[error("frame {index} declares a negative length ({len})")]
    NegativeLength { index: usize, len: i16 },

    #[error("frame {index} is truncated: expected {expected} bytes, found {found}")]
    Truncated {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("frame {index} is too large to encode ({len} bytes)")]
    Oversized { index: usize, len: usize },
}

/// Splits a DCA buffer into its frames without copying the payloads.
pub fn decode(data: Bytes) -> Result<Vec<Bytes>, DcaError> {
    let mut buf = data;
    let mut frames = Vec::new();

    // A lone trailing length byte is treated like a clean end of file.
    while buf.remaining() >= 2 {
        let index = frames.len();
        let len = buf.get_i16_le();
        if len < 0 {
            return Err(DcaError::NegativeLength { index, len });
        }

        let expected = len as usize;
        if buf.remaining() < expected {
            return Err(DcaError::Truncated {
                index,
                expected,
                found: buf.remaining(),
            });
        }
        frames.push(buf.split_to(expected));
    }

    Ok(frames)
}

pub fn encode<'a>(frames: impl IntoIterator<Item = &'a [u8]>) -> Result<Bytes, DcaError> {
    let mut out = BytesMut::new();
    for (index, frame) in frames.into_iter().enumerate() {
        let len = i16::try_from(frame.len()).map_err(|_| DcaError::Oversized {
            index,
            len: frame.len(),
        })?;
        out.put_i16_le(len);
        out.put_slice(frame);
    }
    Ok(out.freeze())
}
