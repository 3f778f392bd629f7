//! Binary channel framing: COBS-delimited frames carrying a little-endian
//! length prefix plus the serialized payload.
//!
//! COBS guarantees the delimiter byte never appears inside a frame, so a
//! receiver can resynchronize on any zero byte after corruption.

/// Frame delimiter on the wire.
pub const DELIMITER: u8 = corncobs::ZERO;

/// Largest raw payload a frame may carry.
pub const MAX_PAYLOAD: usize = 1024;

/// Raw frame size: length prefix + payload.
pub const MAX_RAW: usize = MAX_PAYLOAD + 2;

/// Encoded frame upper bound including the trailing delimiter.
pub const MAX_ENCODED: usize = corncobs::max_encoded_len(MAX_RAW);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    #[error("payload exceeds the frame limit")]
    TooLarge,
    #[error("frame is malformed")]
    Malformed,
}

/// Wraps `payload` into a delimited wire frame. Returns the number of bytes
/// written to `out`.
pub fn encode_frame(payload: &[u8], out: &mut [u8; MAX_ENCODED]) -> Result<usize, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::TooLarge);
    }
    let mut raw = [0u8; MAX_RAW];
    let len = payload.len() as u16;
    raw[..2].copy_from_slice(&len.to_le_bytes());
    raw[2..2 + payload.len()].copy_from_slice(payload);
    let mut used = corncobs::encode_buf(&raw[..2 + payload.len()], out);
    // Guarantee the delimiter regardless of whether the encoder appended it.
    if used == 0 || out[used - 1] != DELIMITER {
        if used >= out.len() {
            return Err(FrameError::TooLarge);
        }
        out[used] = DELIMITER;
        used += 1;
    }
    Ok(used)
}

/// Unwraps one encoded frame into `scratch` and returns the payload slice
/// (length prefix validated and stripped). The trailing delimiter is
/// optional; the decoder gets a terminated copy either way.
pub fn decode_frame<'a>(
    encoded: &[u8],
    scratch: &'a mut [u8; MAX_RAW],
) -> Result<&'a [u8], FrameError> {
    if encoded.len() >= MAX_ENCODED {
        return Err(FrameError::TooLarge);
    }
    let mut terminated = [0u8; MAX_ENCODED + 1];
    terminated[..encoded.len()].copy_from_slice(encoded);
    let total = if encoded.last() == Some(&DELIMITER) {
        encoded.len()
    } else {
        terminated[encoded.len()] = DELIMITER;
        encoded.len() + 1
    };
    let len =
        corncobs::decode_buf(&terminated[..total], scratch).map_err(|_| FrameError::Malformed)?;
    if len < 2 {
        return Err(FrameError::Malformed);
    }
    let payload_len = u16::from_le_bytes([scratch[0], scratch[1]]) as usize;
    if payload_len != len - 2 {
        return Err(FrameError::Malformed);
    }
    Ok(&scratch[2..len])
}

/// Accumulates wire bytes and splits them into delimited frames.
pub struct FrameAccumulator {
    buf: heapless::Vec<u8, MAX_ENCODED>,
    /// Discarding until the next delimiter after an oversized frame.
    resync: bool,
}

impl FrameAccumulator {
    pub const fn new() -> Self {
        FrameAccumulator {
            buf: heapless::Vec::new(),
            resync: false,
        }
    }

    /// Feeds wire bytes; calls `on_frame` with each complete encoded frame
    /// (delimiter stripped). Empty frames are skipped silently.
    pub fn push(&mut self, bytes: &[u8], mut on_frame: impl FnMut(&[u8])) {
        for &byte in bytes {
            if byte == DELIMITER {
                if !self.resync && !self.buf.is_empty() {
                    on_frame(&self.buf);
                }
                self.buf.clear();
                self.resync = false;
            } else if !self.resync && self.buf.push(byte).is_err() {
                log::warn!("binary channel: oversized frame dropped");
                self.buf.clear();
                self.resync = true;
            }
        }
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = b"\x01\x02\x03binary payload with \x00 inside";
        let mut encoded = [0u8; MAX_ENCODED];
        let used = encode_frame(payload, &mut encoded).unwrap();
        assert_eq!(encoded[used - 1], DELIMITER);
        assert!(!encoded[..used - 1].contains(&DELIMITER));

        let mut scratch = [0u8; MAX_RAW];
        let decoded = decode_frame(&encoded[..used - 1], &mut scratch).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn accumulator_splits_back_to_back_frames() {
        let mut wire = Vec::new();
        for payload in [b"abc".as_slice(), b"defg".as_slice()] {
            let mut encoded = [0u8; MAX_ENCODED];
            let used = encode_frame(payload, &mut encoded).unwrap();
            wire.extend_from_slice(&encoded[..used]);
        }
        let mut accumulator = FrameAccumulator::new();
        let mut frames = Vec::new();
        let mut scratch = [0u8; MAX_RAW];
        accumulator.push(&wire, |frame| {
            frames.push(decode_frame(frame, &mut scratch).unwrap().to_vec());
        });
        assert_eq!(frames, vec![b"abc".to_vec(), b"defg".to_vec()]);
    }

    #[test]
    fn corrupt_length_prefix_is_rejected() {
        let mut encoded = [0u8; MAX_ENCODED];
        let used = encode_frame(b"xyz", &mut encoded).unwrap();
        let mut scratch = [0u8; MAX_RAW];
        let whole = decode_frame(&encoded[..used - 1], &mut scratch);
        assert!(whole.is_ok());
        // Truncated frame: prefix no longer matches.
        let mut reencoded = [0u8; MAX_ENCODED];
        let raw = [3u8, 0, b'x'];
        let shortened = corncobs::encode_buf(&raw, &mut reencoded);
        let trimmed = if reencoded[shortened - 1] == DELIMITER {
            &reencoded[..shortened - 1]
        } else {
            &reencoded[..shortened]
        };
        assert_eq!(
            decode_frame(trimmed, &mut scratch),
            Err(FrameError::Malformed)
        );
    }
}
