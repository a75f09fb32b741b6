//! Exhaustive k-NN scan kernel.
//!
//! One pass over the database matrix per query batch: deleted slots are
//! skipped, per-query uid filters applied, and the survivors pushed into
//! per-query top-k heaps. Batches fan out across rayon above a small
//! threshold.

use rayon::prelude::*;

use crate::bitmap::UidSet;
use crate::get_uid;
use crate::heap::ResultHeap;
use crate::metric::{self, MetricKind};

/// Batches at least this large are scanned with one rayon task per query.
const PARALLEL_MIN_QUERIES: usize = 4;

#[derive(Clone, Copy)]
pub struct KnnRequest<'a> {
    pub d: usize,
    pub k: usize,
    pub metric: MetricKind,
    pub metric_arg: f32,
    /// `true`: heap keys are xids. `false`: heap keys are distinct uids and
    /// the better-scoring vector per uid wins. Ignored when `ids` is absent
    /// (keys are then ordinals).
    pub top_vectors: bool,
    /// Ordinal-to-xid table. A slot holding `-1` is a deleted record and is
    /// never returned. When absent, every slot is live and keys are
    /// ordinals.
    pub ids: Option<&'a [i64]>,
    /// One optional filter per query; a filtered query only sees vectors
    /// whose uid is in its set.
    pub filters: Option<&'a [Option<&'a UidSet>]>,
    /// When set, `ids` is consulted for tombstones and filtering but the
    /// emitted keys stay ordinals. Index layers use this so a later stage
    /// can re-rank and map to xids itself.
    pub ordinal_labels: bool,
}

/// Fills `distances`/`labels` (both `nq * k`, row per query) with the k
/// best hits per query, best first, unreached slots `(sentinel, -1)`.
pub fn knn_search(
    req: &KnnRequest<'_>,
    xq: &[f32],
    xb: &[f32],
    distances: &mut [f32],
    labels: &mut [i64],
) {
    let d = req.d;
    assert!(d > 0 && xq.len() % d == 0 && xb.len() % d == 0);
    let nq = xq.len() / d;
    assert_eq!(distances.len(), nq * req.k);
    assert_eq!(labels.len(), nq * req.k);
    if let Some(ids) = req.ids {
        assert_eq!(ids.len(), xb.len() / d);
    }
    if let Some(filters) = req.filters {
        assert_eq!(filters.len(), nq);
    }
    if req.k == 0 || nq == 0 {
        return;
    }

    if nq >= PARALLEL_MIN_QUERIES {
        distances
            .par_chunks_mut(req.k)
            .zip(labels.par_chunks_mut(req.k))
            .enumerate()
            .for_each(|(qi, (dist_row, label_row))| {
                scan_one(req, &xq[qi * d..(qi + 1) * d], xb, qi, dist_row, label_row);
            });
    } else {
        for qi in 0..nq {
            let (dist_row, label_row) = (
                &mut distances[qi * req.k..(qi + 1) * req.k],
                &mut labels[qi * req.k..(qi + 1) * req.k],
            );
            scan_one(req, &xq[qi * d..(qi + 1) * d], xb, qi, dist_row, label_row);
        }
    }
}

fn scan_one(
    req: &KnnRequest<'_>,
    query: &[f32],
    xb: &[f32],
    qi: usize,
    dist_row: &mut [f32],
    label_row: &mut [i64],
) {
    let d = req.d;
    let ntotal = xb.len() / d;
    let filter = req.filters.and_then(|f| f[qi]);

    if req.ids.is_some() && !req.top_vectors && !req.ordinal_labels {
        scan_top_users(req, query, xb, filter, dist_row, label_row);
        return;
    }

    let mut heap = ResultHeap::new(req.k, req.metric);
    for ordinal in 0..ntotal {
        let key = match req.ids {
            Some(ids) => {
                let xid = ids[ordinal];
                if xid == -1 {
                    continue;
                }
                if let Some(set) = filter {
                    if !set.contains(get_uid(xid)) {
                        continue;
                    }
                }
                if req.ordinal_labels {
                    ordinal as i64
                } else {
                    xid
                }
            }
            None => ordinal as i64,
        };
        let score = metric::distance(
            req.metric,
            req.metric_arg,
            query,
            &xb[ordinal * d..(ordinal + 1) * d],
        );
        heap.push(score, key);
    }
    heap.drain_into(dist_row, label_row);
}

/// Top-users mode: one entry per uid, the better-scoring vector wins.
fn scan_top_users(
    req: &KnnRequest<'_>,
    query: &[f32],
    xb: &[f32],
    filter: Option<&UidSet>,
    dist_row: &mut [f32],
    label_row: &mut [i64],
) {
    use std::collections::HashMap;

    let d = req.d;
    let ids = req.ids.expect("top-users mode requires an id table");
    let mut best: HashMap<u32, f32> = HashMap::new();
    for (ordinal, &xid) in ids.iter().enumerate() {
        if xid == -1 {
            continue;
        }
        let uid = get_uid(xid);
        if let Some(set) = filter {
            if !set.contains(uid) {
                continue;
            }
        }
        let score = metric::distance(
            req.metric,
            req.metric_arg,
            query,
            &xb[ordinal * d..(ordinal + 1) * d],
        );
        match best.entry(uid) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if req.metric.is_better(score, *slot.get()) {
                    slot.insert(score);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(score);
            }
        }
    }
    let mut heap = ResultHeap::new(req.k, req.metric);
    for (uid, score) in best {
        heap.push(score, i64::from(uid));
    }
    heap.drain_into(dist_row, label_row);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::make_xid;

    fn request<'a>(
        d: usize,
        k: usize,
        metric: MetricKind,
        ids: Option<&'a [i64]>,
        filters: Option<&'a [Option<&'a UidSet>]>,
        top_vectors: bool,
    ) -> KnnRequest<'a> {
        KnnRequest {
            d,
            k,
            metric,
            metric_arg: 0.0,
            top_vectors,
            ids,
            filters,
            ordinal_labels: false,
        }
    }

    #[test]
    fn ordinal_labels_keep_filtering_semantics() {
        let xb = [1.0f32, 0.0, 0.0, 1.0, 0.9, 0.1];
        let ids = [10i64, -1, 12];
        let xq = [1.0f32, 0.0];
        let mut dist = [0.0f32; 3];
        let mut labels = [0i64; 3];
        let mut req = request(2, 3, MetricKind::InnerProduct, Some(&ids), None, true);
        req.ordinal_labels = true;
        knn_search(&req, &xq, &xb, &mut dist, &mut labels);
        // ordinal 1 is tombstoned; the survivors come back as ordinals
        assert_eq!(labels, [0, 2, -1]);
    }

    #[test]
    fn exact_inner_product_hits() {
        let xb = [1.0f32, 0.0, 0.0, 1.0, 0.5, 0.5];
        let ids = [1000i64, 1001, 1002];
        let xq = [1.0f32, 0.0];
        let mut dist = [0.0f32; 2];
        let mut labels = [0i64; 2];
        let req = request(2, 2, MetricKind::InnerProduct, Some(&ids), None, true);
        knn_search(&req, &xq, &xb, &mut dist, &mut labels);
        assert_eq!(labels[0], 1000);
        assert_eq!(dist[0], 1.0);
        assert_eq!(labels[1], 1002);
    }

    #[test]
    fn deleted_slots_never_surface() {
        let xb = [1.0f32, 0.0, 0.0, 1.0];
        let ids = [-1i64, 7];
        let xq = [1.0f32, 0.0];
        let mut dist = [0.0f32; 2];
        let mut labels = [0i64; 2];
        let req = request(2, 2, MetricKind::InnerProduct, Some(&ids), None, true);
        knn_search(&req, &xq, &xb, &mut dist, &mut labels);
        assert_eq!(labels, [7, -1]);
    }

    #[test]
    fn uid_filter_restricts_candidates() {
        let d = 2;
        let mut xb = Vec::new();
        let mut ids = Vec::new();
        for uid in 0..4u32 {
            xb.extend_from_slice(&[uid as f32, 1.0]);
            ids.push(make_xid(uid, 100 + i64::from(uid)));
        }
        let set: UidSet = [1u32, 2].into_iter().collect();
        let filters = [Some(&set)];
        let xq = [1.0f32, 0.0];
        let mut dist = [0.0f32; 4];
        let mut labels = [0i64; 4];
        let req = request(d, 4, MetricKind::InnerProduct, Some(&ids), Some(&filters), true);
        knn_search(&req, &xq, &xb, &mut dist, &mut labels);
        for &label in labels.iter().filter(|&&l| l != -1) {
            let uid = get_uid(label);
            assert!(uid == 1 || uid == 2, "uid {uid} escaped the filter");
        }
        assert_eq!(labels[2], -1);
    }

    #[test]
    fn empty_filter_yields_empty_rows() {
        let xb = [1.0f32, 0.0];
        let ids = [make_xid(3, 5)];
        let set = UidSet::new();
        let filters = [Some(&set)];
        let xq = [1.0f32, 0.0];
        let mut dist = [0.0f32; 2];
        let mut labels = [0i64; 2];
        let req = request(2, 2, MetricKind::InnerProduct, Some(&ids), Some(&filters), true);
        knn_search(&req, &xq, &xb, &mut dist, &mut labels);
        assert_eq!(labels, [-1, -1]);
    }

    #[test]
    fn top_users_deduplicates_by_uid() {
        let d = 2;
        // Two vectors for uid 1, one for uid 2; the better uid-1 score wins.
        let xb = [0.9f32, 0.0, 0.4, 0.0, 0.6, 0.0];
        let ids = [make_xid(1, 10), make_xid(1, 11), make_xid(2, 20)];
        let xq = [1.0f32, 0.0];
        let mut dist = [0.0f32; 3];
        let mut labels = [0i64; 3];
        let req = request(d, 3, MetricKind::InnerProduct, Some(&ids), None, false);
        knn_search(&req, &xq, &xb, &mut dist, &mut labels);
        assert_eq!(labels[0], 1);
        assert!((dist[0] - 0.9).abs() < 1e-6);
        assert_eq!(labels[1], 2);
        assert_eq!(labels[2], -1);
    }

    #[test]
    fn l2_orders_ascending() {
        let xb = [0.0f32, 0.0, 3.0, 0.0, 1.0, 0.0];
        let xq = [0.0f32, 0.0];
        let mut dist = [0.0f32; 3];
        let mut labels = [0i64; 3];
        let req = request(2, 3, MetricKind::L2, None, None, true);
        knn_search(&req, &xq, &xb, &mut dist, &mut labels);
        assert_eq!(labels, [0, 2, 1]);
        assert_eq!(dist[2], 9.0);
    }
}
