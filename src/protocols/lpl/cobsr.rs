//! Consistent Overhead Byte Stuffing, Reduced (COBS/R).
//!
//! Removes every zero byte from a packet so that a single `0x00` can mark the
//! end of a frame. The reduced variant saves one byte when the final data byte
//! is large enough to double as the last length code.

use super::FrameError;

/// Worst case size of the encoded form of `len` bytes.
pub const fn max_encoded_len(len: usize) -> usize {
    len + len / 254 + 1
}

pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(max_encoded_len(src.len()));
    let mut code_pos = 0;
    let mut search_len: u8 = 1;
    let mut last: u8 = 0;

    out.push(0);

    for (i, &byte) in src.iter().enumerate() {
        last = byte;
        if byte == 0 {
            out[code_pos] = search_len;
            code_pos = out.len();
            out.push(0);
            search_len = 1;
        } else {
            out.push(byte);
            search_len += 1;

            if search_len == 0xFF && i + 1 < src.len() {
                out[code_pos] = search_len;
                code_pos = out.len();
                out.push(0);
                search_len = 1;
            }
        }
    }

    if last < search_len {
        out[code_pos] = search_len;
    } else {
        // final data byte becomes the length code
        out[code_pos] = last;
        out.pop();
    }

    out
}

pub fn decode(src: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(src.len());
    let mut pos = 0;

    while pos < src.len() {
        let code = src[pos];
        pos += 1;

        if code == 0 {
            return Err(FrameError::Stuffing("zero byte in input"));
        }

        let remaining = src.len() - pos;
        let run = code as usize - 1;

        if run < remaining {
            let chunk = &src[pos..pos + run];
            if chunk.contains(&0) {
                return Err(FrameError::Stuffing("zero byte in input"));
            }
            out.extend_from_slice(chunk);
            pos += run;

            if code != 0xFF {
                out.push(0);
            }
        } else {
            let chunk = &src[pos..];
            if chunk.contains(&0) {
                return Err(FrameError::Stuffing("zero byte in input"));
            }
            out.extend_from_slice(chunk);

            if run > remaining {
                out.push(code);
            }
            break;
        }
    }

    Ok(out)
}
