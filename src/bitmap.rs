//! Uid filter sets and their wire codec.
//!
//! A `UidSet` restricts a search to vectors whose uid is a member. The
//! encoding is fixed so external producers can hand filters across the
//! process boundary:
//!
//! ```text
//! byte 0            discriminant: 0x00 small set, 0x01 dense
//! bytes 1..         varint n (base-128, little-endian, high bit continues,
//!                   at most 9 bytes)
//! small set         n little-endian u32 elements
//! dense             n bytes of roaring portable payload
//! ```
//!
//! Sets of cardinality up to 32 stay small; inserting the 33rd element
//! promotes to a roaring bitmap.

use roaring::RoaringBitmap;

use crate::error::{Error, Result};

const DISC_SMALL: u8 = 0x00;
const DISC_DENSE: u8 = 0x01;
const SMALL_MAX: usize = 32;
const VARINT_MAX_BYTES: usize = 9;

#[derive(Clone, Debug, PartialEq)]
pub enum UidSet {
    Small(Vec<u32>),
    Dense(RoaringBitmap),
}

impl Default for UidSet {
    fn default() -> Self {
        UidSet::Small(Vec::new())
    }
}

impl UidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uid: u32) {
        match self {
            UidSet::Small(elems) => {
                if elems.contains(&uid) {
                    return;
                }
                if elems.len() < SMALL_MAX {
                    elems.push(uid);
                    return;
                }
                // 33rd distinct element: promote.
                let mut dense = RoaringBitmap::new();
                for &e in elems.iter() {
                    dense.insert(e);
                }
                dense.insert(uid);
                *self = UidSet::Dense(dense);
            }
            UidSet::Dense(dense) => {
                dense.insert(uid);
            }
        }
    }

    pub fn contains(&self, uid: u32) -> bool {
        match self {
            UidSet::Small(elems) => elems.contains(&uid),
            UidSet::Dense(dense) => dense.contains(uid),
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            UidSet::Small(elems) => elems.len() as u64,
            UidSet::Dense(dense) => dense.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            UidSet::Small(elems) => {
                let mut out = Vec::with_capacity(1 + VARINT_MAX_BYTES + elems.len() * 4);
                out.push(DISC_SMALL);
                write_varint(&mut out, elems.len() as u64);
                for &e in elems {
                    out.extend_from_slice(&e.to_le_bytes());
                }
                out
            }
            UidSet::Dense(dense) => {
                let payload_len = dense.serialized_size();
                let mut out = Vec::with_capacity(1 + VARINT_MAX_BYTES + payload_len);
                out.push(DISC_DENSE);
                write_varint(&mut out, payload_len as u64);
                dense
                    .serialize_into(&mut out)
                    .expect("serialising into a Vec cannot fail");
                out
            }
        }
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let Some((&disc, rest)) = buf.split_first() else {
            return Err(Error::format("uid set: empty buffer"));
        };
        let mut pos = 0usize;
        let n = read_varint(rest, &mut pos)?;
        let body = &rest[pos..];
        match disc {
            DISC_SMALL => {
                let n = n as usize;
                if body.len() < n * 4 {
                    return Err(Error::format(format!(
                        "uid set: small payload truncated, want {} bytes, have {}",
                        n * 4,
                        body.len()
                    )));
                }
                let elems = body[..n * 4]
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Ok(UidSet::Small(elems))
            }
            DISC_DENSE => {
                let n = n as usize;
                if body.len() < n {
                    return Err(Error::format(format!(
                        "uid set: dense payload truncated, want {} bytes, have {}",
                        n,
                        body.len()
                    )));
                }
                let dense = RoaringBitmap::deserialize_from(&body[..n])
                    .map_err(|err| Error::format(format!("uid set: roaring payload: {err}")))?;
                Ok(UidSet::Dense(dense))
            }
            other => Err(Error::format(format!(
                "uid set: invalid discriminant 0x{other:02x}"
            ))),
        }
    }
}

impl FromIterator<u32> for UidSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = UidSet::new();
        for uid in iter {
            set.insert(uid);
        }
        set
    }
}

pub(crate) fn write_varint(out: &mut Vec<u8>, mut n: u64) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            return;
        }
    }
}

pub(crate) fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..VARINT_MAX_BYTES {
        let Some(&byte) = buf.get(*pos) else {
            return Err(Error::format("varint: truncated"));
        };
        *pos += 1;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::format("varint: overflow past 9 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(card: u32) {
        let set: UidSet = (0..card).map(|i| i * 7 + 3).collect();
        let bytes = set.serialize();
        let back = UidSet::deserialize(&bytes).unwrap();
        assert_eq!(set, back, "cardinality {card}");
        if card <= 32 {
            assert!(matches!(back, UidSet::Small(_)));
        } else {
            assert!(matches!(back, UidSet::Dense(_)));
        }
    }

    #[test]
    fn codec_round_trips_across_the_promotion_boundary() {
        for card in [0u32, 1, 31, 32, 33, 100, 10_000] {
            round_trip(card);
        }
    }

    #[test]
    fn promotion_happens_on_the_33rd_element() {
        let mut set = UidSet::new();
        for uid in 0..32 {
            set.insert(uid);
        }
        assert!(matches!(set, UidSet::Small(_)));
        set.insert(99);
        assert!(matches!(set, UidSet::Dense(_)));
        assert_eq!(set.len(), 33);
        assert!(set.contains(99));
        assert!(set.contains(0));
        assert!(!set.contains(1000));
    }

    #[test]
    fn duplicate_inserts_are_idempotent() {
        let mut set = UidSet::new();
        set.insert(5);
        set.insert(5);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn varint_round_trips_representative_grid() {
        for n in [
            0u64,
            (1 << 7) - 1,
            1 << 7,
            (1 << 14) - 1,
            (1 << 21) - 1,
            (1 << 63) - 1,
        ] {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            assert!(buf.len() <= VARINT_MAX_BYTES);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), n);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn bad_discriminant_is_a_format_error() {
        let err = UidSet::deserialize(&[0x02, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn truncated_payload_is_a_format_error() {
        let set: UidSet = (0..10u32).collect();
        let mut bytes = set.serialize();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            UidSet::deserialize(&bytes),
            Err(Error::Format(_))
        ));
    }
}
