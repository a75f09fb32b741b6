//! The database coordinator.
//!
//! Owns the durable base, the optional trained index, the xid-to-ordinal
//! map and the mutation counter. Everything callers touch goes through
//! three locks, coarsest first:
//!
//! * `sync_mutex` — at most one `sync_index` at a time;
//! * `base_mutex` — serialises mutating base-file operations and the
//!   primary-file swap inside a sync;
//! * `inner` — reader/writer lock over the store, the resident index and
//!   the id map. Shared by `search`, exclusive for mutation and the swap.
//!
//! The index lifecycle: below `desired_ntrain` records every query is an
//! exhaustive scan of the base. `sync_index` then snapshots the base files
//! to side copies, compacts the copy, trains a fresh index against it off
//! the lock path, and swaps both the compacted files and the index in
//! under the write lock. Deletes bump the mutation counter; an index built
//! against an older mutation is rebuilt by the next sync.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use parking_lot::{Mutex, RwLock};

use crate::ann::{self, Ann};
use crate::bitmap::UidSet;
use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::flat::{
    bytes_to_f32s, compact_base_files, f32s_to_bytes, i64s_to_bytes, FlatIndex, FlatStore,
};
use crate::get_uid;
use crate::knn::{knn_search, KnnRequest};
use crate::layout::WorkDir;
use crate::metric::MetricKind;
use crate::refine::Refine;

struct Resident {
    refine: Refine,
    /// Mutation generation the index covers. Deletes that land between
    /// the sync snapshot and the swap are folded back in as tombstones,
    /// so this is the counter value at swap time, not at snapshot time.
    mutation: u64,
    ntrain: usize,
    /// Ordinals `[0, nindexed)` of the base are covered by the index.
    nindexed: usize,
}

struct DbInner {
    store: FlatStore,
    xid2num: HashMap<i64, usize>,
    index: Option<Resident>,
}

pub struct Database {
    cfg: DbConfig,
    layout: WorkDir,
    d: usize,
    sync_mutex: Mutex<()>,
    base_mutex: Mutex<()>,
    inner: RwLock<DbInner>,
}

impl Database {
    /// Opens or creates a database under `work_dir`. The newest index
    /// artifact matching the configured recipe is loaded when it is still
    /// consistent with the base files; anything stale is ignored and
    /// rebuilt by the next `sync_index`.
    pub fn open(work_dir: impl AsRef<Path>, d: usize, cfg: DbConfig) -> Result<Self> {
        if d == 0 {
            return Err(Error::DimMismatch { expected: 1, got: 0 });
        }
        // Validate the recipe/metric combination before touching disk.
        Ann::from_recipe(&cfg.recipe, d, cfg.metric, cfg.metric_arg)?;

        let layout = WorkDir::create(work_dir)?;
        let store = FlatStore::open(layout.fvecs(), layout.xids(), layout.mutation(), d)?;
        let xid2num = build_map(store.xids());
        let mut inner = DbInner {
            store,
            xid2num,
            index: None,
        };

        if let Some((path, art_mutation, art_ntrain)) = layout.latest_artifact(&cfg.recipe)? {
            match ann::read_artifact(&path) {
                Ok(base)
                    if base.d() == d
                        && base.ntotal() <= inner.store.ntotal()
                        && art_mutation == inner.store.mutation() =>
                {
                    let nindexed = base.ntotal();
                    let mut flat = FlatIndex::new(d, cfg.metric, cfg.metric_arg);
                    flat.add(&inner.store.vectors()[..nindexed * d]);
                    match Refine::from_parts(base, flat) {
                        Ok(refine) => {
                            tracing::info!(
                                path = %path.display(),
                                nindexed,
                                "loaded index artifact"
                            );
                            inner.index = Some(Resident {
                                refine,
                                mutation: art_mutation,
                                ntrain: art_ntrain,
                                nindexed,
                            });
                        }
                        Err(err) => {
                            tracing::warn!(%err, "discarding inconsistent index artifact");
                        }
                    }
                }
                Ok(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        "index artifact is stale for the current base, ignoring"
                    );
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "unreadable index artifact");
                }
            }
        }

        tracing::info!(
            dir = %layout.dir().display(),
            ntotal = inner.store.ntotal(),
            indexed = inner.index.as_ref().map_or(0, |r| r.nindexed),
            "database open"
        );
        Ok(Self {
            cfg,
            layout,
            d,
            sync_mutex: Mutex::new(()),
            base_mutex: Mutex::new(()),
            inner: RwLock::new(inner),
        })
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn config(&self) -> &DbConfig {
        &self.cfg
    }

    /// Current record count, soft-deleted slots included. Slots leave the
    /// count only when a sync compacts them away.
    pub fn get_total(&self) -> usize {
        self.inner.read().store.ntotal()
    }

    /// Number of records the resident index does not cover yet.
    pub fn get_flat_size(&self) -> usize {
        let inner = self.inner.read();
        let nindexed = inner.index.as_ref().map_or(0, |r| r.nindexed);
        inner.store.ntotal().saturating_sub(nindexed)
    }

    /// `(ntrain, nindexed, unindexed)` of the resident index.
    pub fn get_index_state(&self) -> (usize, usize, usize) {
        let inner = self.inner.read();
        let ntotal = inner.store.ntotal();
        match &inner.index {
            Some(res) => (res.ntrain, res.nindexed, ntotal - res.nindexed),
            None => (0, 0, ntotal),
        }
    }

    pub fn mutation(&self) -> u64 {
        self.inner.read().store.mutation()
    }

    /// Appends `n` records. No batch-wide deduplication is guaranteed; as
    /// a collision heuristic the call is a no-op when `ids[0]` is already
    /// present.
    pub fn add_with_ids(&self, xb: &[f32], ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if xb.len() != ids.len() * self.d {
            return Err(Error::DimMismatch {
                expected: ids.len() * self.d,
                got: xb.len(),
            });
        }
        let _base = self.base_mutex.lock();
        let mut inner = self.inner.write();
        if inner.xid2num.contains_key(&ids[0]) {
            return Ok(());
        }
        let start = inner.store.ntotal();
        inner.store.append(xb, ids)?;
        for (i, &xid) in ids.iter().enumerate() {
            inner.xid2num.insert(xid, start + i);
        }
        if let Some(res) = inner.index.as_mut() {
            res.refine.add(xb)?;
            res.nindexed = res.refine.ntotal();
        }
        Ok(())
    }

    /// Overwrites the vectors of already-present ids in place. The
    /// resident index keeps serving the old vectors until the next
    /// `sync_index`; callers doing updates should sync afterwards.
    pub fn update_with_ids(&self, xb: &[f32], ids: &[i64]) -> Result<usize> {
        if xb.len() != ids.len() * self.d {
            return Err(Error::DimMismatch {
                expected: ids.len() * self.d,
                got: xb.len(),
            });
        }
        let _base = self.base_mutex.lock();
        let mut inner = self.inner.write();
        let mut updated = 0usize;
        for (i, &xid) in ids.iter().enumerate() {
            let ordinal = match inner.xid2num.get(&xid) {
                Some(&ordinal) => ordinal,
                None => continue,
            };
            inner
                .store
                .update_vector(ordinal, &xb[i * self.d..(i + 1) * self.d])?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Logically deletes each present id: the slot is stamped `-1` in
    /// memory and on disk and the mutation counter is bumped per delete.
    pub fn remove_ids(&self, ids: &[i64]) -> Result<usize> {
        let _base = self.base_mutex.lock();
        let mut inner = self.inner.write();
        let mut removed = 0usize;
        for &xid in ids {
            let Some(ordinal) = inner.xid2num.remove(&xid) else {
                continue;
            };
            inner.store.remove(ordinal)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Truncates the base files, forgets the resident index and deletes
    /// every artifact.
    pub fn reset(&self) -> Result<()> {
        let _sync = self.sync_mutex.lock();
        let _base = self.base_mutex.lock();
        let mut inner = self.inner.write();
        inner.store.reset()?;
        inner.xid2num.clear();
        inner.index = None;
        self.layout.prune_artifacts(&self.cfg.recipe, None)?;
        tracing::info!(dir = %self.layout.dir().display(), "database reset");
        Ok(())
    }

    /// Top-k batch search. `distances` and `xids_out` must both hold
    /// `nq * k` slots; every row comes back best-first with holes
    /// compacted to the front and `(sentinel, -1)` behind them.
    pub fn search(
        &self,
        k: usize,
        xq: &[f32],
        filters: Option<&[Option<&UidSet>]>,
        distances: &mut [f32],
        xids_out: &mut [i64],
    ) -> Result<()> {
        if self.d == 0 || xq.len() % self.d != 0 {
            return Err(Error::DimMismatch {
                expected: self.d,
                got: xq.len(),
            });
        }
        let nq = xq.len() / self.d;
        if distances.len() != nq * k || xids_out.len() != nq * k {
            return Err(Error::format(format!(
                "output buffers must hold nq*k = {} entries",
                nq * k
            )));
        }
        if let Some(filters) = filters {
            if filters.len() != nq {
                return Err(Error::format("one filter slot per query required"));
            }
        }

        let sentinel = self.cfg.metric.worst();
        distances.fill(sentinel);
        xids_out.fill(-1);
        if nq == 0 || k == 0 {
            return Ok(());
        }

        let inner = self.inner.read();
        match &inner.index {
            None => self.search_flat(&inner, k, xq, filters, distances, xids_out),
            Some(res) => self.search_refined(&inner, res, k, xq, filters, distances, xids_out),
        }
    }

    /// Pre-training path: one exhaustive kernel pass over the base.
    fn search_flat(
        &self,
        inner: &DbInner,
        k: usize,
        xq: &[f32],
        filters: Option<&[Option<&UidSet>]>,
        distances: &mut [f32],
        xids_out: &mut [i64],
    ) -> Result<()> {
        let req = KnnRequest {
            d: self.d,
            k,
            metric: self.cfg.metric,
            metric_arg: self.cfg.metric_arg,
            top_vectors: self.cfg.top_vectors,
            ids: Some(inner.store.xids()),
            filters,
            ordinal_labels: false,
        };
        knn_search(&req, xq, inner.store.vectors(), distances, xids_out);
        let nq = xq.len() / self.d;
        for qi in 0..nq {
            self.finish_row(
                &mut distances[qi * k..(qi + 1) * k],
                &mut xids_out[qi * k..(qi + 1) * k],
            );
        }
        Ok(())
    }

    /// Index path: refined candidates plus the un-indexed tail, merged,
    /// then mapped from ordinals to xids.
    fn search_refined(
        &self,
        inner: &DbInner,
        res: &Resident,
        k: usize,
        xq: &[f32],
        filters: Option<&[Option<&UidSet>]>,
        distances: &mut [f32],
        xids_out: &mut [i64],
    ) -> Result<()> {
        let d = self.d;
        let nq = xq.len() / d;
        let sentinel = self.cfg.metric.worst();
        let nindexed = res.nindexed;
        let ntotal = inner.store.ntotal();

        let mut ref_dist = vec![sentinel; nq * k];
        let mut ref_labels = vec![-1i64; nq * k];
        res.refine.search(
            k,
            xq,
            &self.cfg.query_params,
            Some(inner.store.xids()),
            filters,
            &mut ref_dist,
            &mut ref_labels,
        )?;

        let (tail_dist, tail_labels) = if ntotal > nindexed {
            let mut tail_dist = vec![sentinel; nq * k];
            let mut tail_labels = vec![-1i64; nq * k];
            let req = KnnRequest {
                d,
                k,
                metric: self.cfg.metric,
                metric_arg: self.cfg.metric_arg,
                top_vectors: true,
                ids: Some(&inner.store.xids()[nindexed..]),
                filters,
                ordinal_labels: true,
            };
            knn_search(
                &req,
                xq,
                &inner.store.vectors()[nindexed * d..],
                &mut tail_dist,
                &mut tail_labels,
            );
            for label in tail_labels.iter_mut() {
                if *label >= 0 {
                    *label += nindexed as i64;
                }
            }
            (tail_dist, tail_labels)
        } else {
            (Vec::new(), Vec::new())
        };

        for qi in 0..nq {
            let refined = row_candidates(&ref_dist[qi * k..(qi + 1) * k], &ref_labels[qi * k..(qi + 1) * k]);
            let tail = if tail_dist.is_empty() {
                Vec::new()
            } else {
                row_candidates(&tail_dist[qi * k..(qi + 1) * k], &tail_labels[qi * k..(qi + 1) * k])
            };
            let merged = merge_candidates(self.cfg.metric, k, &refined, &tail);
            self.write_row(
                inner,
                &merged,
                &mut distances[qi * k..(qi + 1) * k],
                &mut xids_out[qi * k..(qi + 1) * k],
            );
        }
        Ok(())
    }

    /// Maps merged `(score, ordinal)` candidates to the output row:
    /// tombstones dropped, uids deduplicated in top-users mode, the
    /// distance threshold applied, survivors compacted to the front.
    fn write_row(
        &self,
        inner: &DbInner,
        merged: &[(f32, i64)],
        dist_row: &mut [f32],
        id_row: &mut [i64],
    ) {
        let k = dist_row.len();
        let mut seen_uids = HashSet::new();
        let mut slot = 0usize;
        for &(score, ordinal) in merged {
            let xid = inner.store.xids()[ordinal as usize];
            if xid == -1 {
                continue;
            }
            if !self.passes_threshold(score) {
                continue;
            }
            let key = if self.cfg.top_vectors {
                xid
            } else {
                let uid = get_uid(xid);
                if !seen_uids.insert(uid) {
                    continue;
                }
                i64::from(uid)
            };
            dist_row[slot] = score;
            id_row[slot] = key;
            slot += 1;
            if slot == k {
                break;
            }
        }
        let sentinel = self.cfg.metric.worst();
        for i in slot..k {
            dist_row[i] = sentinel;
            id_row[i] = -1;
        }
    }

    /// Drops below-threshold entries from a kernel row and compacts the
    /// survivors to the front, preserving order.
    fn finish_row(&self, dist_row: &mut [f32], id_row: &mut [i64]) {
        let k = id_row.len();
        let mut slot = 0usize;
        for i in 0..k {
            let id = id_row[i];
            if id == -1 || !self.passes_threshold(dist_row[i]) {
                continue;
            }
            dist_row[slot] = dist_row[i];
            id_row[slot] = id;
            slot += 1;
        }
        let sentinel = self.cfg.metric.worst();
        for i in slot..k {
            dist_row[i] = sentinel;
            id_row[i] = -1;
        }
    }

    fn passes_threshold(&self, score: f32) -> bool {
        match self.cfg.dist_threshold {
            // the threshold itself still passes
            Some(threshold) => !self.cfg.metric.is_better(threshold, score),
            None => true,
        }
    }

    /// Compact-train-swap. Returns `true` when a new index was installed.
    ///
    /// Early exits: below `desired_ntrain` records, or a resident index
    /// that is still valid for the current mutation with an un-indexed gap
    /// under `allow_add_gap` (the latter only re-dumps a missing artifact
    /// file). Training runs against the compacted side copies, off every
    /// lock the mutators and readers use.
    pub fn sync_index(&self) -> Result<bool> {
        let _sync = self.sync_mutex.lock();

        {
            let inner = self.inner.read();
            let ntotal = inner.store.ntotal();
            if ntotal < self.cfg.desired_ntrain {
                tracing::debug!(
                    ntotal,
                    desired = self.cfg.desired_ntrain,
                    "sync skipped, not enough records to train"
                );
                return Ok(false);
            }
            if let Some(res) = &inner.index {
                let gap = ntotal - res.nindexed;
                if res.mutation == inner.store.mutation() && gap < self.cfg.allow_add_gap {
                    let path = self.layout.artifact(&self.cfg.recipe, res.mutation, res.ntrain);
                    if !path.exists() {
                        ann::write_artifact(&path, res.refine.base())?;
                        tracing::info!(path = %path.display(), "re-dumped resident index");
                    }
                    return Ok(false);
                }
            }
        }

        let tmp_fvecs = WorkDir::tmp_sibling(&self.layout.fvecs());
        let tmp_xids = WorkDir::tmp_sibling(&self.layout.xids());
        let tmp_mutation = WorkDir::tmp_sibling(&self.layout.mutation());

        // Snapshot the base files under the base lock; adds and searches
        // resume while the copy is compacted and trained against.
        let (snapshot_n, snapshot_mutation) = {
            let _base = self.base_mutex.lock();
            let inner = self.inner.read();
            copy_file(&self.layout.fvecs(), &tmp_fvecs)?;
            copy_file(&self.layout.xids(), &tmp_xids)?;
            copy_file(&self.layout.mutation(), &tmp_mutation)?;
            (inner.store.ntotal(), inner.store.mutation())
        };

        let live = compact_base_files(&tmp_fvecs, &tmp_xids, self.d)?;
        if live == 0 {
            // every snapshot record was tombstoned; nothing to train on
            let _ = std::fs::remove_file(&tmp_fvecs);
            let _ = std::fs::remove_file(&tmp_xids);
            let _ = std::fs::remove_file(&tmp_mutation);
            tracing::warn!("sync abandoned, snapshot holds no live records");
            return Ok(false);
        }
        tracing::info!(
            snapshot = snapshot_n,
            live,
            mutation = snapshot_mutation,
            "snapshot compacted, training index"
        );

        let vectors = bytes_to_f32s(
            &std::fs::read(&tmp_fvecs).map_err(|err| Error::io(&tmp_fvecs, err))?,
        );
        let ntrain = live.min(self.cfg.training_sample_max);
        let mut base = Ann::from_recipe(&self.cfg.recipe, self.d, self.cfg.metric, self.cfg.metric_arg)?;
        base.train(&vectors[..ntrain * self.d])?;
        base.add(&vectors)?;
        let mut flat = FlatIndex::new(self.d, self.cfg.metric, self.cfg.metric_arg);
        flat.add(&vectors);
        let mut refine = Refine::from_parts(base, flat)?;
        drop(vectors);

        // Swap phase: fold in records added since the snapshot, promote
        // the side files, reopen, and install the fresh index.
        let _base = self.base_mutex.lock();
        let mut inner = self.inner.write();
        let current_n = inner.store.ntotal();
        if current_n > snapshot_n {
            let tail_vecs = &inner.store.vectors()[snapshot_n * self.d..];
            let tail_xids = &inner.store.xids()[snapshot_n..];
            append_bytes(&tmp_fvecs, &f32s_to_bytes(tail_vecs))?;
            append_bytes(&tmp_xids, &i64s_to_bytes(tail_xids))?;
            refine.add(tail_vecs)?;
        }
        // The side counter still holds the snapshot value; carry the
        // current one across the swap.
        let current_mutation = inner.store.mutation();
        std::fs::write(&tmp_mutation, current_mutation.to_le_bytes())
            .map_err(|err| Error::io(&tmp_mutation, err))?;

        let old_map = std::mem::take(&mut inner.xid2num);
        WorkDir::promote(&tmp_fvecs, &self.layout.fvecs())?;
        WorkDir::promote(&tmp_xids, &self.layout.xids())?;
        WorkDir::promote(&tmp_mutation, &self.layout.mutation())?;
        let mut store = FlatStore::open(
            self.layout.fvecs(),
            self.layout.xids(),
            self.layout.mutation(),
            self.d,
        )?;

        // Records deleted between the snapshot and the swap are live in
        // the compacted copy; re-stamp them so they stay invisible until
        // the next sync.
        let stale: Vec<usize> = store
            .xids()
            .iter()
            .enumerate()
            .filter(|&(_, &xid)| xid != -1 && !old_map.contains_key(&xid))
            .map(|(ordinal, _)| ordinal)
            .collect();
        for ordinal in stale {
            store.stamp_tombstone(ordinal)?;
        }

        inner.xid2num = build_map(store.xids());
        inner.store = store;
        let nindexed = refine.ntotal();
        // The re-stamping above accounts for every delete up to
        // current_mutation, so the index is valid for that generation and
        // the artifact is named with it; the promoted counter file agrees.
        inner.index = Some(Resident {
            refine,
            mutation: current_mutation,
            ntrain,
            nindexed,
        });

        let artifact = self.layout.artifact(&self.cfg.recipe, current_mutation, ntrain);
        let res = inner.index.as_ref().expect("just installed");
        ann::write_artifact(&artifact, res.refine.base())?;
        self.layout.prune_artifacts(&self.cfg.recipe, Some(&artifact))?;
        tracing::info!(
            path = %artifact.display(),
            nindexed,
            ntrain,
            "index trained and swapped in"
        );
        Ok(true)
    }
}

fn build_map(xids: &[i64]) -> HashMap<i64, usize> {
    let mut map = HashMap::with_capacity(xids.len());
    for (ordinal, &xid) in xids.iter().enumerate() {
        if xid != -1 {
            map.insert(xid, ordinal);
        }
    }
    map
}

/// Collects the live `(score, ordinal)` prefix of a heap row.
fn row_candidates(dist_row: &[f32], label_row: &[i64]) -> Vec<(f32, i64)> {
    dist_row
        .iter()
        .zip(label_row.iter())
        .filter(|&(_, &label)| label >= 0)
        .map(|(&score, &label)| (score, label))
        .collect()
}

/// Merges two best-first candidate rows into the k best.
fn merge_candidates(
    metric: MetricKind,
    k: usize,
    a: &[(f32, i64)],
    b: &[(f32, i64)],
) -> Vec<(f32, i64)> {
    let mut out = Vec::with_capacity(k.min(a.len() + b.len()));
    let (mut ai, mut bi) = (0usize, 0usize);
    while out.len() < k {
        match (a.get(ai), b.get(bi)) {
            (Some(&(ascore, alabel)), Some(&(bscore, _))) if !metric.is_better(bscore, ascore) => {
                out.push((ascore, alabel));
                ai += 1;
            }
            (Some(_), Some(&(bscore, blabel))) => {
                out.push((bscore, blabel));
                bi += 1;
            }
            (Some(&pair), None) => {
                out.push(pair);
                ai += 1;
            }
            (None, Some(&pair)) => {
                out.push(pair);
                bi += 1;
            }
            (None, None) => break,
        }
    }
    out
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    std::fs::copy(from, to)
        .map(|_| ())
        .map_err(|err| Error::io(from, err))
}

fn append_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|err| Error::io(path, err))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_data())
        .map_err(|err| Error::io(path, err))
}
