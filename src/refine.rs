//! Exact re-ranking over a coarse index.
//!
//! The base index answers with `k * k_factor` approximate candidates; each
//! survivor is re-scored against the raw vector kept in the refine store
//! and the exact scores are re-heaped down to `k`. Base and store ingest
//! in lock-step, so a base ordinal is always a valid store ordinal.

use crate::ann::Ann;
use crate::bitmap::UidSet;
use crate::config::QueryParams;
use crate::error::{Error, Result};
use crate::flat::FlatIndex;
use crate::heap::ResultHeap;
use crate::metric::{self, MetricKind};

pub struct Refine {
    base: Ann,
    store: FlatIndex,
    metric: MetricKind,
    metric_arg: f32,
}

impl Refine {
    pub fn new(base: Ann, metric: MetricKind, metric_arg: f32) -> Self {
        let store = FlatIndex::new(base.d(), metric, metric_arg);
        Self {
            base,
            store,
            metric,
            metric_arg,
        }
    }

    /// Reassembles a refine pair whose store was rebuilt externally, e.g.
    /// from the base files after loading an index artifact.
    pub fn from_parts(base: Ann, store: FlatIndex) -> Result<Self> {
        if base.ntotal() != store.ntotal() {
            return Err(Error::format(format!(
                "refine pair out of step: base {} vs store {}",
                base.ntotal(),
                store.ntotal()
            )));
        }
        Ok(Self {
            base,
            metric: store.metric(),
            metric_arg: store.metric_arg(),
            store,
        })
    }

    pub fn base(&self) -> &Ann {
        &self.base
    }

    pub fn d(&self) -> usize {
        self.store.d()
    }

    pub fn ntotal(&self) -> usize {
        self.store.ntotal()
    }

    pub fn ntrain(&self) -> usize {
        self.base.ntrain()
    }

    pub fn is_trained(&self) -> bool {
        self.base.is_trained()
    }

    pub fn train(&mut self, xs: &[f32]) -> Result<()> {
        self.base.train(xs)
    }

    /// Adds to the base and the store together.
    pub fn add(&mut self, xb: &[f32]) -> Result<()> {
        if !self.base.is_trained() {
            return Err(Error::NotTrained);
        }
        self.base.add(xb)?;
        self.store.add(xb);
        debug_assert_eq!(self.base.ntotal(), self.store.ntotal());
        Ok(())
    }

    /// Two-stage search. Labels are ordinals, best-first per row, holes
    /// backfilled with `(sentinel, -1)`.
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
        let d = self.d();
        let nq = xq.len() / d;
        let kc = (k * params.k_factor.max(1)).min(self.store.ntotal().max(1));
        let mut coarse_dist = vec![0.0f32; nq * kc];
        let mut coarse_labels = vec![0i64; nq * kc];
        self.base.search(
            kc,
            xq,
            params,
            ids,
            filters,
            &mut coarse_dist,
            &mut coarse_labels,
        )?;

        for qi in 0..nq {
            let query = &xq[qi * d..(qi + 1) * d];
            let mut heap = ResultHeap::new(k, self.metric);
            for &ordinal in &coarse_labels[qi * kc..(qi + 1) * kc] {
                if ordinal < 0 {
                    continue;
                }
                let exact = metric::distance(
                    self.metric,
                    self.metric_arg,
                    query,
                    self.store.vector(ordinal as usize),
                );
                heap.push(exact, ordinal);
            }
            heap.drain_into(
                &mut distances[qi * k..(qi + 1) * k],
                &mut labels[qi * k..(qi + 1) * k],
            );
        }
        Ok(())
    }

    pub fn reconstruct(&self, ordinal: usize, out: &mut [f32]) {
        self.store.reconstruct(ordinal, out);
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
    fn add_before_train_is_rejected() {
        let base = Ann::from_recipe("IVF4,PQ2", 8, MetricKind::InnerProduct, 0.0).unwrap();
        let mut refine = Refine::new(base, MetricKind::InnerProduct, 0.0);
        assert!(matches!(refine.add(&[0.0; 8]), Err(Error::NotTrained)));
    }

    #[test]
    fn refinement_recovers_exact_scores() {
        let d = 16;
        let xs = unit_vectors(600, d, 5);
        let base = Ann::from_recipe("IVF8,PQ4", d, MetricKind::InnerProduct, 0.0).unwrap();
        let mut refine = Refine::new(base, MetricKind::InnerProduct, 0.0);
        refine.train(&xs).unwrap();
        refine.add(&xs).unwrap();

        let params = QueryParams::parse("nprobe=8,k_factor=4");
        let k = 5;
        let mut dist = vec![0.0f32; k];
        let mut labels = vec![0i64; k];
        let mut self_hits = 0;
        for probe in 0..30usize {
            refine
                .search(
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
                self_hits += 1;
                // the re-ranked score is exact, so a unit vector scores 1
                assert!((dist[0] - 1.0).abs() < 1e-4, "score {}", dist[0]);
            }
        }
        assert!(self_hits >= 28, "recall after refinement: {self_hits}/30");
    }
}
