//! Product quantizer.
//!
//! Splits a `d`-dimensional vector into `m` subspaces and replaces each
//! slice with the index of its nearest codebook centroid, one byte per
//! subspace. Search decodes nothing: per-query lookup tables turn code
//! scanning into `m` table adds.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ivf::train_kmeans;
use crate::metric;

const KSUB_MAX: usize = 256;
const TRAIN_ITERS: usize = 15;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProductQuantizer {
    d: usize,
    m: usize,
    dsub: usize,
    ksub: usize,
    /// `m * ksub * dsub`, grouped by subquantizer.
    centroids: Vec<f32>,
}

impl ProductQuantizer {
    /// Trains `m` codebooks of up to 256 centroids each on `xs`.
    pub fn train(d: usize, m: usize, xs: &[f32]) -> Result<Self> {
        if m == 0 || d % m != 0 {
            return Err(Error::format(format!(
                "product quantizer: {m} subquantizers do not divide dim {d}"
            )));
        }
        let n = xs.len() / d;
        if n == 0 {
            return Err(Error::format("product quantizer: no training vectors"));
        }
        let dsub = d / m;
        let ksub = KSUB_MAX.min(n);
        let mut centroids = Vec::with_capacity(m * ksub * dsub);
        let mut sub = vec![0.0f32; n * dsub];
        for mi in 0..m {
            for (row, chunk) in sub.chunks_exact_mut(dsub).enumerate() {
                let start = row * d + mi * dsub;
                chunk.copy_from_slice(&xs[start..start + dsub]);
            }
            let book = train_kmeans(&sub, dsub, ksub, TRAIN_ITERS, 0x9E3779B9 ^ mi as u64);
            debug_assert_eq!(book.len(), ksub * dsub);
            centroids.extend_from_slice(&book);
        }
        Ok(Self {
            d,
            m,
            dsub,
            ksub,
            centroids,
        })
    }

    pub fn code_size(&self) -> usize {
        self.m
    }

    pub fn d(&self) -> usize {
        self.d
    }

    fn book(&self, mi: usize) -> &[f32] {
        let stride = self.ksub * self.dsub;
        &self.centroids[mi * stride..(mi + 1) * stride]
    }

    pub fn encode(&self, v: &[f32], out: &mut [u8]) {
        debug_assert_eq!(v.len(), self.d);
        debug_assert_eq!(out.len(), self.m);
        for mi in 0..self.m {
            let sub = &v[mi * self.dsub..(mi + 1) * self.dsub];
            let book = self.book(mi);
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for ci in 0..self.ksub {
                let dist = metric::l2_sqr(sub, &book[ci * self.dsub..(ci + 1) * self.dsub]);
                if dist < best_dist {
                    best_dist = dist;
                    best = ci;
                }
            }
            out[mi] = best as u8;
        }
    }

    pub fn decode(&self, code: &[u8], out: &mut [f32]) {
        debug_assert_eq!(code.len(), self.m);
        debug_assert_eq!(out.len(), self.d);
        for mi in 0..self.m {
            let ci = code[mi] as usize;
            let book = self.book(mi);
            out[mi * self.dsub..(mi + 1) * self.dsub]
                .copy_from_slice(&book[ci * self.dsub..(ci + 1) * self.dsub]);
        }
    }

    /// Asymmetric L2 table: entry `(mi, ci)` holds the squared distance
    /// between the query slice and that centroid.
    pub fn lut_l2(&self, q: &[f32]) -> Vec<f32> {
        debug_assert_eq!(q.len(), self.d);
        let mut table = vec![0.0f32; self.m * self.ksub];
        for mi in 0..self.m {
            let sub = &q[mi * self.dsub..(mi + 1) * self.dsub];
            let book = self.book(mi);
            for ci in 0..self.ksub {
                table[mi * self.ksub + ci] =
                    metric::l2_sqr(sub, &book[ci * self.dsub..(ci + 1) * self.dsub]);
            }
        }
        table
    }

    /// Inner-product table: entry `(mi, ci)` holds the dot product of the
    /// query slice with that centroid.
    pub fn lut_ip(&self, q: &[f32]) -> Vec<f32> {
        debug_assert_eq!(q.len(), self.d);
        let mut table = vec![0.0f32; self.m * self.ksub];
        for mi in 0..self.m {
            let sub = &q[mi * self.dsub..(mi + 1) * self.dsub];
            let book = self.book(mi);
            for ci in 0..self.ksub {
                table[mi * self.ksub + ci] =
                    metric::dot(sub, &book[ci * self.dsub..(ci + 1) * self.dsub]);
            }
        }
        table
    }

    /// Sums the table entries a code addresses.
    #[inline]
    pub fn lookup(&self, table: &[f32], code: &[u8]) -> f32 {
        let mut acc = 0.0f32;
        for mi in 0..self.m {
            acc += table[mi * self.ksub + code[mi] as usize];
        }
        acc
    }
}
