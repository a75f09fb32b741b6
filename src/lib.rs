//! anndb — an embeddable approximate-nearest-neighbour vector database.
//!
//! A [`Database`] owns one working directory holding an append-only flat
//! table of `(xid, vector)` records and, once enough records exist, a
//! trained compressed index on top of it. Searches answer top-k queries
//! under inner-product or L2 metrics, optionally filtered by a per-query
//! [`UidSet`] over the uid field encoded in each external id.
//!
//! ```no_run
//! use anndb::{Database, DbConfig};
//!
//! let db = Database::open("/tmp/vectors", 128, DbConfig::default())?;
//! db.add_with_ids(&vec![0.0; 128], &[anndb::make_xid(7, 1001)])?;
//! let mut scores = vec![0.0f32; 10];
//! let mut xids = vec![0i64; 10];
//! db.search(10, &vec![0.0; 128], None, &mut scores, &mut xids)?;
//! # Ok::<(), anndb::Error>(())
//! ```

pub mod ann;
pub mod bitmap;
pub mod config;
pub mod db;
pub mod error;
pub mod flat;
pub mod heap;
pub mod ivf;
pub mod knn;
pub mod layout;
pub mod metric;
pub mod pq;
pub mod refine;

pub use ann::{read_artifact, write_artifact, Ann, Recipe};
pub use bitmap::UidSet;
pub use config::{DbConfig, QueryParams};
pub use db::Database;
pub use error::{Error, Result};
pub use flat::{FlatDisk, FlatIndex, FlatStore};
pub use layout::{clear_work_dir, WorkDir};
pub use metric::MetricKind;
pub use refine::Refine;

/// Number of low bits of an xid holding the product id; the remaining
/// high 30 bits hold the user id.
pub const PID_BITS: u32 = 34;
const PID_MASK: i64 = (1 << PID_BITS) - 1;

/// Packs a user id and a product id into an external id.
#[inline]
pub fn make_xid(uid: u32, pid: i64) -> i64 {
    (i64::from(uid) << PID_BITS) | (pid & PID_MASK)
}

/// The 30-bit user id carried in the high bits of an xid.
#[inline]
pub fn get_uid(xid: i64) -> u32 {
    ((xid >> PID_BITS) & 0x3FFF_FFFF) as u32
}

/// The 34-bit product id carried in the low bits of an xid.
#[inline]
pub fn get_pid(xid: i64) -> i64 {
    xid & PID_MASK
}

/// L2-normalises a vector in place.
pub fn norm_vec(v: &mut [f32]) {
    anndists::dist::distances::l2_normalize(v);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xid_encoding_is_inverse_to_the_accessors() {
        for (uid, pid) in [
            (0u32, 0i64),
            (1, 1),
            (0x3FFF_FFFF, (1 << 34) - 1),
            (12345, 987_654_321),
        ] {
            let xid = make_xid(uid, pid);
            assert_eq!(get_uid(xid), uid, "uid for xid {xid:#x}");
            assert_eq!(get_pid(xid), pid, "pid for xid {xid:#x}");
        }
    }

    #[test]
    fn norm_vec_produces_unit_length() {
        let mut v = vec![3.0f32, 4.0];
        norm_vec(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }
}
