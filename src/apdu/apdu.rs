//! ISO/IEC 7816-4 command APDU codec.
//!
//! Command encoding options:
//!
//! ```text
//! Case 1:  |CLA|INS|P1|P2|                                n = 4
//! Case 2s: |CLA|INS|P1|P2|LE|                             n = 5
//! Case 3s: |CLA|INS|P1|P2|LC|...BODY...|                  n = 6..260
//! Case 4s: |CLA|INS|P1|P2|LC|...BODY...|LE|               n = 7..261
//! Case 2e: |CLA|INS|P1|P2|00|LE1|LE2|                     n = 7
//! Case 3e: |CLA|INS|P1|P2|00|LC1|LC2|...BODY...|          n = 8..65542
//! Case 4e: |CLA|INS|P1|P2|00|LC1|LC2|...BODY...|LE1|LE2|  n = 10..65544
//! ```
//!
//! LE, LE1|LE2 may be zero, meaning the maximum (256 or 65536). LC must
//! not be zero and LC1|LC2 must not be zero|zero.

use crate::{Error, Result};

/// `SELECT` instruction byte.
pub const INS_SELECT: u8 = 0xA4;
/// `SELECT` P1 value for selection by DF name (AID).
pub const SELECT_BY_NAME: u8 = 0x04;

/// Normal completion.
pub const SW_OK: u16 = 0x9000;
/// No precise diagnosis.
pub const SW_ERR_GENERAL: u16 = 0x6A00;
/// File or application not found.
pub const SW_FILE_NOT_FOUND: u16 = 0x6A82;
/// Class not supported.
pub const SW_CLA_NOT_SUPPORTED: u16 = 0x6E00;

/// Decoded command APDU. `data` borrows from the wire buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[must_use]
pub struct Apdu<'a> {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: &'a [u8],
    /// Expected response length, `0..=65536`. Zero means none expected.
    pub le: u32,
}

impl<'a> Apdu<'a> {
    /// Produces the shortest encoding that fits the command.
    ///
    /// Fails with [`Error::InvalidArgument`] when `data` exceeds 65535
    /// bytes or `le` exceeds 65536.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > 0xFFFF || self.le > 0x10000 {
            return Err(Error::InvalidArgument("apdu field out of range"));
        }
        let short = self.data.len() <= 0xFF && self.le <= 0x100;
        let mut buf = Vec::with_capacity(10 + self.data.len());
        buf.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if !self.data.is_empty() {
            if short {
                // Cases 3s and 4s
                buf.push(self.data.len() as u8);
            } else {
                // Cases 3e and 4e
                buf.push(0);
                buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
            }
            buf.extend_from_slice(self.data);
        }
        if self.le > 0 {
            if short {
                // Cases 2s and 4s, 256 encoded as zero
                buf.push(if self.le == 0x100 { 0 } else { self.le as u8 });
            } else {
                // Cases 2e and 4e, 65536 encoded as zero|zero
                if self.data.is_empty() {
                    buf.push(0);
                }
                let le = if self.le == 0x10000 { 0 } else { self.le as u16 };
                buf.extend_from_slice(&le.to_be_bytes());
            }
        }
        Ok(buf)
    }

    /// Classifies `raw` by total length and the fifth octet and decodes
    /// it. Fails on malformed lengths without partial results.
    pub fn decode(raw: &'a [u8]) -> Result<Self> {
        const BAD: Error = Error::InvalidArgument("malformed apdu");
        let &[cla, ins, p1, p2, ref rest @ ..] = raw else {
            return Err(BAD);
        };
        let hdr = Self {
            cla,
            ins,
            p1,
            p2,
            ..Self::default()
        };
        match *rest {
            // Case 1
            [] => Ok(hdr),
            // Case 2s
            [le] => Ok(Self {
                le: if le == 0 { 0x100 } else { le.into() },
                ..hdr
            }),
            // Case 2e
            [0, le1, le2] => Ok(Self {
                le: match u32::from(le1) << 8 | u32::from(le2) {
                    0 => 0x10000,
                    le => le,
                },
                ..hdr
            }),
            // Cases 3e and 4e
            [0, lc1, lc2, ref body @ ..] => {
                let lc = usize::from(lc1) << 8 | usize::from(lc2);
                match body.len().checked_sub(lc) {
                    Some(0) => Ok(Self {
                        data: &body[..lc],
                        ..hdr
                    }),
                    Some(2) => Ok(Self {
                        data: &body[..lc],
                        le: match u32::from(body[lc]) << 8 | u32::from(body[lc + 1]) {
                            0 => 0x10000,
                            le => le,
                        },
                        ..hdr
                    }),
                    _ => Err(BAD),
                }
            }
            // Extended-length marker with a truncated body
            [0, _] => Err(BAD),
            // Cases 3s and 4s
            [lc, ref body @ ..] => {
                let lc = usize::from(lc);
                match body.len().checked_sub(lc) {
                    Some(0) => Ok(Self {
                        data: &body[..lc],
                        ..hdr
                    }),
                    Some(1) => Ok(Self {
                        data: &body[..lc],
                        le: match body[lc] {
                            0 => 0x100,
                            le => le.into(),
                        },
                        ..hdr
                    }),
                    _ => Err(BAD),
                }
            }
        }
    }

    /// Returns whether this is a `SELECT` by DF name command.
    #[inline]
    #[must_use]
    pub fn is_select_by_name(&self) -> bool {
        self.cla == 0x00 && self.ins == INS_SELECT && self.p1 == SELECT_BY_NAME
    }

    /// Returns whether the class byte marks a proprietary-class command.
    #[inline]
    #[must_use]
    pub const fn is_proprietary_class(&self) -> bool {
        self.cla & 0x80 != 0
    }
}

/// Builds a response TPDU: the payload followed by `SW1 SW2`.
#[must_use]
pub fn rsp(sw: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 2);
    buf.extend_from_slice(data);
    buf.extend_from_slice(&sw.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests;
