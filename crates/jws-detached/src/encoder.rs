//! Incremental base64url encoding
//!
//! Base64 maps 3 input bytes to 4 output characters, so chunk boundaries that
//! do not fall on a multiple of 3 leave 1 or 2 bytes that cannot be encoded
//! yet. They are carried over to the next call and flushed by [`finish`].
//!
//! [`finish`]: Base64UrlEncoder::finish

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

/// Streaming base64url encoder without padding
#[derive(Debug, Default, Clone)]
pub struct Base64UrlEncoder {
    carry: [u8; 2],
    carry_len: usize,
}

impl Base64UrlEncoder {
    /// Create an encoder with an empty carry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back from the previous call (0..=2)
    pub fn pending(&self) -> usize {
        self.carry_len
    }

    /// Encode `input`, replacing the contents of `out` with the produced text.
    ///
    /// Only whole 3-byte groups are emitted; the remainder is kept for the next
    /// call.
    pub fn update(&mut self, mut input: &[u8], out: &mut Vec<u8>) {
        out.clear();

        if self.carry_len > 0 {
            let needed = 3 - self.carry_len;
            if input.len() < needed {
                self.carry[self.carry_len..self.carry_len + input.len()].copy_from_slice(input);
                self.carry_len += input.len();
                return;
            }

            let mut group = [0u8; 3];
            group[..self.carry_len].copy_from_slice(&self.carry[..self.carry_len]);
            group[self.carry_len..].copy_from_slice(&input[..needed]);
            input = &input[needed..];
            self.carry_len = 0;
            encode_into(&group, out);
        }

        let whole = input.len() - input.len() % 3;
        encode_into(&input[..whole], out);

        let rest = &input[whole..];
        self.carry[..rest.len()].copy_from_slice(rest);
        self.carry_len = rest.len();
    }

    /// Flush the carried bytes as a final 2- or 3-character group
    pub fn finish(mut self, out: &mut Vec<u8>) {
        out.clear();
        encode_into(&self.carry[..self.carry_len], out);
        self.carry_len = 0;
    }
}

fn encode_into(input: &[u8], out: &mut Vec<u8>) {
    if input.is_empty() {
        return;
    }
    let start = out.len();
    out.resize(start + input.len().div_ceil(3) * 4, 0);
    // without padding the encoded length can be shorter than the 4/3 bound
    let written = URL_SAFE_NO_PAD
        .encode_slice(input, &mut out[start..])
        .expect("output sized for the padded encoding");
    out.truncate(start + written);
}
