//! Per-database configuration.
//!
//! Everything that used to live in process-global state is captured here so
//! two databases in one process cannot interfere.

use crate::metric::MetricKind;

/// Records below this count are served by the flat scan alone; `sync_index`
/// refuses to train until the store reaches it.
pub const DESIRED_NTRAIN: usize = 10_000;

/// A resident index with fewer than this many un-indexed records behind it
/// is considered fresh enough to keep.
pub const ALLOW_ADD_GAP: usize = 10_000;

/// Upper bound on the number of vectors fed to index training.
pub const TRAIN_SAMPLE_MAX: usize = 200_000;

/// Default record capacity a new single-file store is sized for.
pub const INITIAL_CAPACITY: usize = 1_000_000;

#[derive(Clone, Debug)]
pub struct DbConfig {
    pub metric: MetricKind,
    /// Scalar argument for metric kinds above L2 (e.g. the Minkowski
    /// exponent). Ignored for inner product and L2.
    pub metric_arg: f32,
    /// Index recipe, e.g. `"IVF4096,PQ32"`, `"IVF1024_HNSW32,Flat"`,
    /// `"Flat"`.
    pub recipe: String,
    pub query_params: QueryParams,
    /// Results on the wrong side of this score are dropped from the row.
    /// `None` keeps everything the heap produced.
    pub dist_threshold: Option<f32>,
    pub desired_ntrain: usize,
    pub allow_add_gap: usize,
    pub initial_capacity: usize,
    pub training_sample_max: usize,
    /// `true`: result keys are xids. `false`: result keys are distinct
    /// uids, the better-scoring vector per uid wins.
    pub top_vectors: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            metric: MetricKind::InnerProduct,
            metric_arg: 0.0,
            recipe: "IVF4096,PQ32".to_string(),
            query_params: QueryParams::parse("nprobe=256,ht=256"),
            dist_threshold: None,
            desired_ntrain: DESIRED_NTRAIN,
            allow_add_gap: ALLOW_ADD_GAP,
            initial_capacity: INITIAL_CAPACITY,
            training_sample_max: TRAIN_SAMPLE_MAX,
            top_vectors: true,
        }
    }
}

/// Tuning knobs consumed at query time, parsed from the comma-separated
/// `key=value` form the index recipes are tuned with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryParams {
    /// Number of inverted lists probed per query.
    pub nprobe: usize,
    /// Hamming threshold for polysemous code filtering. Accepted for
    /// parameter-string compatibility; the scan kernels here do not prune
    /// on it.
    pub ht: usize,
    /// Refinement multiplier: the coarse index is asked for `k * k_factor`
    /// candidates before exact re-ranking.
    pub k_factor: usize,
    /// Cap on the number of codes scanned per query. 0 means unlimited.
    pub max_codes: usize,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            nprobe: 256,
            ht: 256,
            k_factor: 1,
            max_codes: 0,
        }
    }
}

impl QueryParams {
    /// Lenient parse: unknown keys and malformed values fall back to the
    /// defaults, with a warning.
    pub fn parse(params: &str) -> Self {
        let mut out = Self::default();
        for pair in params.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                tracing::warn!(param = pair, "ignoring malformed query parameter");
                continue;
            };
            let Ok(value) = value.trim().parse::<usize>() else {
                tracing::warn!(param = pair, "ignoring non-numeric query parameter");
                continue;
            };
            match key.trim() {
                "nprobe" => out.nprobe = value.max(1),
                "ht" => out.ht = value,
                "k_factor" => out.k_factor = value.max(1),
                "max_codes" => out.max_codes = value,
                other => {
                    tracing::warn!(key = other, "ignoring unrecognised query parameter");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys() {
        let p = QueryParams::parse("nprobe=32,ht=128,k_factor=4,max_codes=5000");
        assert_eq!(p.nprobe, 32);
        assert_eq!(p.ht, 128);
        assert_eq!(p.k_factor, 4);
        assert_eq!(p.max_codes, 5000);
    }

    #[test]
    fn unknown_and_malformed_fall_back() {
        let p = QueryParams::parse("nprobe=8,efSearch=77,bogus,k_factor=zero");
        assert_eq!(p.nprobe, 8);
        assert_eq!(p.k_factor, 1);
        assert_eq!(p.max_codes, 0);
    }

    #[test]
    fn zero_values_are_clamped() {
        let p = QueryParams::parse("nprobe=0,k_factor=0");
        assert_eq!(p.nprobe, 1);
        assert_eq!(p.k_factor, 1);
    }
}
