//! Inverted-file indexes and the k-means trainer they share.
//!
//! Two variants sit behind the same shape: `IvfPq` keeps product-quantised
//! codes per list, `IvfHnsw` keeps raw vectors and replaces the brute-force
//! coarse quantiser with a small navigable graph over the centroids. Both
//! return insertion ordinals as labels; tombstone and uid-filter semantics
//! come from the caller's id table.

use anndists::dist::distances::{DistDot, DistL2};
use hnsw_rs::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::bitmap::UidSet;
use crate::config::QueryParams;
use crate::error::{Error, Result};
use crate::get_uid;
use crate::heap::ResultHeap;
use crate::metric::{self, MetricKind};
use crate::pq::ProductQuantizer;

const KMEANS_SEED: u64 = 0x5EEDED;
const KMEANS_ITERS: usize = 15;

/// Lloyd iterations over `xs`, k-means++ seeding, squared-L2 assignment.
/// Returns `min(k, n)` centroids as a flat `k * d` matrix. Empty clusters
/// keep their previous centroid.
pub(crate) fn train_kmeans(xs: &[f32], d: usize, k: usize, iters: usize, seed: u64) -> Vec<f32> {
    let n = xs.len() / d;
    let k = k.min(n).max(1);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = init_kmeans_pp(xs, d, k, &mut rng);

    let mut assignment = vec![0usize; n];
    for _ in 0..iters.max(1) {
        for (row, slot) in assignment.iter_mut().enumerate() {
            *slot = nearest_centroid(&centroids, d, &xs[row * d..(row + 1) * d]).0;
        }
        let mut sums = vec![0.0f32; centroids.len()];
        let mut counts = vec![0usize; k];
        for (row, &cluster) in assignment.iter().enumerate() {
            counts[cluster] += 1;
            for (dst, &src) in sums[cluster * d..(cluster + 1) * d]
                .iter_mut()
                .zip(&xs[row * d..(row + 1) * d])
            {
                *dst += src;
            }
        }
        for cluster in 0..k {
            if counts[cluster] == 0 {
                continue;
            }
            let inv = 1.0 / counts[cluster] as f32;
            for (dst, &src) in centroids[cluster * d..(cluster + 1) * d]
                .iter_mut()
                .zip(&sums[cluster * d..(cluster + 1) * d])
            {
                *dst = src * inv;
            }
        }
    }
    centroids
}

fn init_kmeans_pp(xs: &[f32], d: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = xs.len() / d;
    let mut centroids = Vec::with_capacity(k * d);
    let first = rng.gen_range(0..n);
    centroids.extend_from_slice(&xs[first * d..(first + 1) * d]);
    let mut weights = vec![0.0f32; n];
    while centroids.len() / d < k {
        let mut total = 0.0f32;
        for row in 0..n {
            let (_, dist) = nearest_centroid(&centroids, d, &xs[row * d..(row + 1) * d]);
            weights[row] = dist;
            total += dist;
        }
        if total <= f32::EPSILON {
            // all remaining points coincide with a centroid
            let row = rng.gen_range(0..n);
            centroids.extend_from_slice(&xs[row * d..(row + 1) * d]);
            continue;
        }
        let mut target = rng.gen::<f32>() * total;
        let mut chosen = n - 1;
        for (row, &w) in weights.iter().enumerate() {
            target -= w;
            if target <= 0.0 {
                chosen = row;
                break;
            }
        }
        centroids.extend_from_slice(&xs[chosen * d..(chosen + 1) * d]);
    }
    centroids
}

fn nearest_centroid(centroids: &[f32], d: usize, v: &[f32]) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_dist = f32::INFINITY;
    for (ci, centroid) in centroids.chunks_exact(d).enumerate() {
        let dist = metric::l2_sqr(centroid, v);
        if dist < best_dist {
            best_dist = dist;
            best = ci;
        }
    }
    (best, best_dist)
}

/// Ranks the `nprobe` best lists for a query by coarse-centroid score.
fn rank_lists(
    centroids: &[f32],
    d: usize,
    metric: MetricKind,
    query: &[f32],
    nprobe: usize,
) -> Vec<usize> {
    let nlist = centroids.len() / d;
    let mut scored: Vec<(usize, f32)> = centroids
        .chunks_exact(d)
        .enumerate()
        .map(|(ci, centroid)| (ci, metric::distance(metric, 0.0, query, centroid)))
        .collect();
    scored.sort_by(|a, b| {
        if metric.higher_is_better() {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
        } else {
            a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
        }
    });
    scored
        .into_iter()
        .take(nprobe.min(nlist))
        .map(|(ci, _)| ci)
        .collect()
}

fn require_ip_or_l2(metric: MetricKind) -> Result<()> {
    match metric {
        MetricKind::InnerProduct | MetricKind::L2 => Ok(()),
        other => Err(Error::UnsupportedMetric(other.code())),
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CodeList {
    ids: Vec<i64>,
    codes: Vec<u8>,
}

/// Inverted file with product-quantised codes. Residual encoding under L2;
/// raw-vector encoding under inner product.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IvfPq {
    d: usize,
    nlist: usize,
    m: usize,
    metric: MetricKind,
    by_residual: bool,
    centroids: Vec<f32>,
    pq: Option<ProductQuantizer>,
    lists: Vec<CodeList>,
    ntotal: usize,
    ntrain: usize,
}

impl IvfPq {
    pub fn new(d: usize, nlist: usize, m: usize, metric: MetricKind) -> Result<Self> {
        require_ip_or_l2(metric)?;
        if m == 0 || d % m != 0 {
            return Err(Error::format(format!(
                "recipe PQ{m} does not divide dim {d}"
            )));
        }
        Ok(Self {
            d,
            nlist: nlist.max(1),
            m,
            metric,
            by_residual: metric == MetricKind::L2,
            centroids: Vec::new(),
            pq: None,
            lists: Vec::new(),
            ntotal: 0,
            ntrain: 0,
        })
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn ntotal(&self) -> usize {
        self.ntotal
    }

    pub fn ntrain(&self) -> usize {
        self.ntrain
    }

    pub fn is_trained(&self) -> bool {
        self.pq.is_some()
    }

    pub fn train(&mut self, xs: &[f32]) -> Result<()> {
        let n = xs.len() / self.d;
        if n == 0 {
            return Err(Error::format("ivf-pq: no training vectors"));
        }
        self.centroids = train_kmeans(xs, self.d, self.nlist, KMEANS_ITERS, KMEANS_SEED);
        self.nlist = self.centroids.len() / self.d;
        let pq_input = if self.by_residual {
            let mut residuals = vec![0.0f32; xs.len()];
            for (row, v) in xs.chunks_exact(self.d).enumerate() {
                let (ci, _) = nearest_centroid(&self.centroids, self.d, v);
                let centroid = &self.centroids[ci * self.d..(ci + 1) * self.d];
                for j in 0..self.d {
                    residuals[row * self.d + j] = v[j] - centroid[j];
                }
            }
            residuals
        } else {
            xs.to_vec()
        };
        self.pq = Some(ProductQuantizer::train(self.d, self.m, &pq_input)?);
        self.lists = vec![CodeList::default(); self.nlist];
        self.ntrain = n;
        Ok(())
    }

    pub fn add(&mut self, xb: &[f32]) -> Result<()> {
        let Some(pq) = &self.pq else {
            return Err(Error::NotTrained);
        };
        let mut code = vec![0u8; pq.code_size()];
        let mut residual = vec![0.0f32; self.d];
        for v in xb.chunks_exact(self.d) {
            let (ci, _) = nearest_centroid(&self.centroids, self.d, v);
            if self.by_residual {
                let centroid = &self.centroids[ci * self.d..(ci + 1) * self.d];
                for j in 0..self.d {
                    residual[j] = v[j] - centroid[j];
                }
                pq.encode(&residual, &mut code);
            } else {
                pq.encode(v, &mut code);
            }
            let list = &mut self.lists[ci];
            list.ids.push(self.ntotal as i64);
            list.codes.extend_from_slice(&code);
            self.ntotal += 1;
        }
        Ok(())
    }

    /// Approximate search over the probed lists. Labels are ordinals.
    pub fn search(
        &self,
        k: usize,
        xq: &[f32],
        params: &QueryParams,
        ids: Option<&[i64]>,
        filters: Option<&[Option<&UidSet>]>,
        distances: &mut [f32],
        labels: &mut [i64],
    ) -> Result<()> {
        let Some(pq) = &self.pq else {
            return Err(Error::NotTrained);
        };
        let nq = xq.len() / self.d;
        let mut shifted = vec![0.0f32; self.d];
        for qi in 0..nq {
            let query = &xq[qi * self.d..(qi + 1) * self.d];
            let filter = filters.and_then(|f| f[qi]);
            let mut heap = ResultHeap::new(k, self.metric);
            let mut scanned = 0usize;
            'probes: for ci in rank_lists(&self.centroids, self.d, self.metric, query, params.nprobe)
            {
                let list = &self.lists[ci];
                if list.ids.is_empty() {
                    continue;
                }
                let table = if self.by_residual {
                    let centroid = &self.centroids[ci * self.d..(ci + 1) * self.d];
                    for j in 0..self.d {
                        shifted[j] = query[j] - centroid[j];
                    }
                    pq.lut_l2(&shifted)
                } else if self.metric == MetricKind::L2 {
                    pq.lut_l2(query)
                } else {
                    pq.lut_ip(query)
                };
                for (pos, &ordinal) in list.ids.iter().enumerate() {
                    if let Some(ids) = ids {
                        let xid = ids[ordinal as usize];
                        if xid == -1 {
                            continue;
                        }
                        if let Some(set) = filter {
                            if !set.contains(get_uid(xid)) {
                                continue;
                            }
                        }
                    }
                    let code = &list.codes[pos * pq.code_size()..(pos + 1) * pq.code_size()];
                    heap.push(pq.lookup(&table, code), ordinal);
                    scanned += 1;
                    if params.max_codes > 0 && scanned >= params.max_codes {
                        break 'probes;
                    }
                }
            }
            heap.drain_into(
                &mut distances[qi * k..(qi + 1) * k],
                &mut labels[qi * k..(qi + 1) * k],
            );
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct VecList {
    ids: Vec<i64>,
    vecs: Vec<f32>,
}

enum CoarseGraph {
    Ip(Hnsw<'static, f32, DistDot>),
    L2(Hnsw<'static, f32, DistL2>),
}

/// Inverted file with raw-vector lists and a graph coarse quantiser.
#[derive(Serialize, Deserialize)]
pub struct IvfHnsw {
    d: usize,
    nlist: usize,
    graph_m: usize,
    metric: MetricKind,
    centroids: Vec<f32>,
    lists: Vec<VecList>,
    ntotal: usize,
    ntrain: usize,
    trained: bool,
    #[serde(skip)]
    graph: Option<CoarseGraph>,
}

impl IvfHnsw {
    pub fn new(d: usize, nlist: usize, graph_m: usize, metric: MetricKind) -> Result<Self> {
        require_ip_or_l2(metric)?;
        Ok(Self {
            d,
            nlist: nlist.max(1),
            graph_m: graph_m.max(4),
            metric,
            centroids: Vec::new(),
            lists: Vec::new(),
            ntotal: 0,
            ntrain: 0,
            trained: false,
            graph: None,
        })
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn ntotal(&self) -> usize {
        self.ntotal
    }

    pub fn ntrain(&self) -> usize {
        self.ntrain
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn train(&mut self, xs: &[f32]) -> Result<()> {
        let n = xs.len() / self.d;
        if n == 0 {
            return Err(Error::format("ivf-hnsw: no training vectors"));
        }
        self.centroids = train_kmeans(xs, self.d, self.nlist, KMEANS_ITERS, KMEANS_SEED);
        self.nlist = self.centroids.len() / self.d;
        self.lists = vec![VecList::default(); self.nlist];
        self.ntrain = n;
        self.trained = true;
        self.rebuild_graph();
        Ok(())
    }

    /// The graph is not serialised; it is rebuilt from the centroids after
    /// deserialisation and after training.
    pub(crate) fn rebuild_graph(&mut self) {
        if !self.trained {
            self.graph = None;
            return;
        }
        let nb_layer = 16;
        let ef_c = 200;
        let graph = match self.metric {
            MetricKind::InnerProduct => {
                let h = Hnsw::<f32, DistDot>::new(self.graph_m, self.nlist.max(1), nb_layer, ef_c, DistDot {});
                for (ci, centroid) in self.centroids.chunks_exact(self.d).enumerate() {
                    let v = centroid.to_vec();
                    h.insert((&v, ci));
                }
                CoarseGraph::Ip(h)
            }
            _ => {
                let h = Hnsw::<f32, DistL2>::new(self.graph_m, self.nlist.max(1), nb_layer, ef_c, DistL2 {});
                for (ci, centroid) in self.centroids.chunks_exact(self.d).enumerate() {
                    let v = centroid.to_vec();
                    h.insert((&v, ci));
                }
                CoarseGraph::L2(h)
            }
        };
        self.graph = Some(graph);
    }

    fn probe(&self, query: &[f32], nprobe: usize) -> Vec<usize> {
        let nprobe = nprobe.min(self.nlist).max(1);
        let ef = nprobe.saturating_mul(2).clamp(16, 10_000);
        match &self.graph {
            Some(CoarseGraph::Ip(h)) => h
                .search(query, nprobe, ef)
                .into_iter()
                .map(|n| n.d_id)
                .collect(),
            Some(CoarseGraph::L2(h)) => h
                .search(query, nprobe, ef)
                .into_iter()
                .map(|n| n.d_id)
                .collect(),
            // graph absent only before training; fall back to brute force
            None => rank_lists(&self.centroids, self.d, self.metric, query, nprobe),
        }
    }

    pub fn add(&mut self, xb: &[f32]) -> Result<()> {
        if !self.trained {
            return Err(Error::NotTrained);
        }
        for v in xb.chunks_exact(self.d) {
            let ci = self
                .probe(v, 1)
                .first()
                .copied()
                .unwrap_or_else(|| nearest_centroid(&self.centroids, self.d, v).0);
            let list = &mut self.lists[ci];
            list.ids.push(self.ntotal as i64);
            list.vecs.extend_from_slice(v);
            self.ntotal += 1;
        }
        Ok(())
    }

    /// Exact distances over the probed lists. Labels are ordinals.
    pub fn search(
        &self,
        k: usize,
        xq: &[f32],
        params: &QueryParams,
        ids: Option<&[i64]>,
        filters: Option<&[Option<&UidSet>]>,
        distances: &mut [f32],
        labels: &mut [i64],
    ) -> Result<()> {
        if !self.trained {
            return Err(Error::NotTrained);
        }
        let nq = xq.len() / self.d;
        for qi in 0..nq {
            let query = &xq[qi * self.d..(qi + 1) * self.d];
            let filter = filters.and_then(|f| f[qi]);
            let mut heap = ResultHeap::new(k, self.metric);
            let mut scanned = 0usize;
            'probes: for ci in self.probe(query, params.nprobe) {
                let list = &self.lists[ci];
                for (pos, &ordinal) in list.ids.iter().enumerate() {
                    if let Some(ids) = ids {
                        let xid = ids[ordinal as usize];
                        if xid == -1 {
                            continue;
                        }
                        if let Some(set) = filter {
                            if !set.contains(get_uid(xid)) {
                                continue;
                            }
                        }
                    }
                    let v = &list.vecs[pos * self.d..(pos + 1) * self.d];
                    heap.push(metric::distance(self.metric, 0.0, query, v), ordinal);
                    scanned += 1;
                    if params.max_codes > 0 && scanned >= params.max_codes {
                        break 'probes;
                    }
                }
            }
            heap.drain_into(
                &mut distances[qi * k..(qi + 1) * k],
                &mut labels[qi * k..(qi + 1) * k],
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn unit_vectors(n: usize, d: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut xs = vec![0.0f32; n * d];
        for v in xs.chunks_exact_mut(d) {
            let mut norm = 0.0f32;
            for x in v.iter_mut() {
                *x = rng.gen::<f32>() - 0.5;
                norm += *x * *x;
            }
            let inv = 1.0 / norm.sqrt().max(1e-12);
            for x in v.iter_mut() {
                *x *= inv;
            }
        }
        xs
    }

    #[test]
    fn kmeans_places_centroids_near_clusters() {
        // two tight clusters far apart
        let mut xs = Vec::new();
        for i in 0..50 {
            xs.extend_from_slice(&[10.0 + (i % 5) as f32 * 0.01, 10.0]);
            xs.extend_from_slice(&[-10.0, -10.0 - (i % 5) as f32 * 0.01]);
        }
        let centroids = train_kmeans(&xs, 2, 2, 10, 1);
        assert_eq!(centroids.len(), 4);
        let near = |c: &[f32], x: f32, y: f32| (c[0] - x).abs() < 1.0 && (c[1] - y).abs() < 1.0;
        let a = &centroids[0..2];
        let b = &centroids[2..4];
        assert!(
            (near(a, 10.0, 10.0) && near(b, -10.0, -10.0))
                || (near(a, -10.0, -10.0) && near(b, 10.0, 10.0)),
            "centroids {centroids:?}"
        );
    }

    #[test]
    fn ivfpq_add_requires_training() {
        let mut ivf = IvfPq::new(8, 4, 2, MetricKind::InnerProduct).unwrap();
        assert!(matches!(ivf.add(&[0.0; 8]), Err(Error::NotTrained)));
    }

    #[test]
    fn ivfpq_finds_itself_with_full_probe() {
        let d = 16;
        let xs = unit_vectors(800, d, 9);
        let mut ivf = IvfPq::new(d, 8, 4, MetricKind::InnerProduct).unwrap();
        ivf.train(&xs).unwrap();
        ivf.add(&xs).unwrap();
        assert_eq!(ivf.ntotal(), 800);

        let params = QueryParams::parse("nprobe=8");
        let k = 8;
        let mut dist = vec![0.0f32; k];
        let mut labels = vec![0i64; k];
        let mut hits = 0;
        for probe in 0..40usize {
            ivf.search(
                k,
                &xs[probe * d..(probe + 1) * d],
                &params,
                None,
                None,
                &mut dist,
                &mut labels,
            )
            .unwrap();
            if labels.contains(&(probe as i64)) {
                hits += 1;
            }
        }
        assert!(hits >= 36, "recall too low: {hits}/40");
    }

    #[test]
    fn ivfpq_respects_max_codes() {
        let d = 8;
        let xs = unit_vectors(300, d, 4);
        let mut ivf = IvfPq::new(d, 4, 2, MetricKind::L2).unwrap();
        ivf.train(&xs).unwrap();
        ivf.add(&xs).unwrap();
        let params = QueryParams::parse("nprobe=4,max_codes=10");
        let mut dist = vec![0.0f32; 300];
        let mut labels = vec![0i64; 300];
        ivf.search(300, &xs[..d], &params, None, None, &mut dist, &mut labels)
            .unwrap();
        let returned = labels.iter().filter(|&&l| l != -1).count();
        assert!(returned <= 10, "max_codes ignored: {returned}");
    }

    #[test]
    fn ivfhnsw_probes_via_graph() {
        let d = 16;
        let xs = unit_vectors(500, d, 11);
        let mut ivf = IvfHnsw::new(d, 8, 16, MetricKind::InnerProduct).unwrap();
        ivf.train(&xs).unwrap();
        ivf.add(&xs).unwrap();
        let params = QueryParams::parse("nprobe=8");
        let k = 4;
        let mut dist = vec![0.0f32; k];
        let mut labels = vec![0i64; k];
        let mut hits = 0;
        for probe in 0..25usize {
            ivf.search(
                k,
                &xs[probe * d..(probe + 1) * d],
                &params,
                None,
                None,
                &mut dist,
                &mut labels,
            )
            .unwrap();
            if labels[0] == probe as i64 {
                hits += 1;
            }
        }
        // exact distances over all lists: the vector itself must win
        assert_eq!(hits, 25);
    }
}
