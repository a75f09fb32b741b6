//! Flat vector storage.
//!
//! Three shapes of the same table:
//!
//! * [`FlatIndex`] — in-memory matrix, the exhaustive index variant and the
//!   re-rank store of the refine layer.
//! * [`FlatStore`] — the split-file durable base (`base.fvecs` +
//!   `base.xids` + `base.mutation`): append-only vectors, tombstone
//!   deletes, a monotonic mutation counter.
//! * [`FlatDisk`] — the single-file memory-mapped variant with an `"IxFD"`
//!   header, grown by doubling, guarded by its own reader/writer lock.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::bitmap::UidSet;
use crate::error::{retry_interrupted, Error, Result};
use crate::knn::{knn_search, KnnRequest};
use crate::metric::{self, MetricKind};

pub(crate) const FVECS_BYTES_PER_DIM: usize = 4;
pub(crate) const XID_BYTES: usize = 8;

const DISK_MAGIC: &[u8; 4] = b"IxFD";

pub(crate) fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub(crate) fn bytes_to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub(crate) fn i64s_to_bytes(values: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub(crate) fn bytes_to_i64s(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| Error::io(path, err))
}

/// In-memory flat matrix. Labels are insertion ordinals.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlatIndex {
    d: usize,
    metric: MetricKind,
    metric_arg: f32,
    xb: Vec<f32>,
}

impl FlatIndex {
    pub fn new(d: usize, metric: MetricKind, metric_arg: f32) -> Self {
        Self {
            d,
            metric,
            metric_arg,
            xb: Vec::new(),
        }
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    pub fn metric_arg(&self) -> f32 {
        self.metric_arg
    }

    pub fn ntotal(&self) -> usize {
        self.xb.len() / self.d
    }

    pub fn add(&mut self, xb: &[f32]) {
        debug_assert_eq!(xb.len() % self.d, 0);
        self.xb.extend_from_slice(xb);
    }

    pub fn vector(&self, ordinal: usize) -> &[f32] {
        &self.xb[ordinal * self.d..(ordinal + 1) * self.d]
    }

    pub fn vectors(&self) -> &[f32] {
        &self.xb
    }

    pub fn reconstruct(&self, ordinal: usize, out: &mut [f32]) {
        out.copy_from_slice(self.vector(ordinal));
    }

    /// Exhaustive search; `ids` supplies tombstone/filter semantics when
    /// the caller has an external id table for these ordinals.
    pub fn search(
        &self,
        k: usize,
        xq: &[f32],
        top_vectors: bool,
        ids: Option<&[i64]>,
        filters: Option<&[Option<&UidSet>]>,
        distances: &mut [f32],
        labels: &mut [i64],
    ) {
        let req = KnnRequest {
            d: self.d,
            k,
            metric: self.metric,
            metric_arg: self.metric_arg,
            top_vectors,
            ids,
            filters,
            ordinal_labels: false,
        };
        knn_search(&req, xq, &self.xb, distances, labels);
    }

    /// Like [`FlatIndex::search`], but labels stay ordinals while `ids`
    /// still supplies tombstone and filter semantics.
    pub fn search_ordinals(
        &self,
        k: usize,
        xq: &[f32],
        ids: Option<&[i64]>,
        filters: Option<&[Option<&UidSet>]>,
        distances: &mut [f32],
        labels: &mut [i64],
    ) {
        let req = KnnRequest {
            d: self.d,
            k,
            metric: self.metric,
            metric_arg: self.metric_arg,
            top_vectors: true,
            ids,
            filters,
            ordinal_labels: true,
        };
        knn_search(&req, xq, &self.xb, distances, labels);
    }

    pub fn compute_distance_subset(&self, query: &[f32], labels: &[i64], distances: &mut [f32]) {
        for (slot, &label) in labels.iter().enumerate() {
            distances[slot] = if label < 0 {
                self.metric.worst()
            } else {
                metric::distance(self.metric, self.metric_arg, query, self.vector(label as usize))
            };
        }
    }

    pub fn reset(&mut self) {
        self.xb.clear();
    }
}

/// The split-file durable base: `base.fvecs` holds raw little-endian
/// vectors, `base.xids` the aligned external ids (`-1` = deleted),
/// `base.mutation` the delete counter. The whole table is mirrored in
/// memory; files are the source of truth on open.
#[derive(Debug)]
pub struct FlatStore {
    d: usize,
    fvecs_path: PathBuf,
    xids_path: PathBuf,
    mutation_path: PathBuf,
    fvecs: File,
    xids_file: File,
    mutation_file: File,
    base: Vec<f32>,
    xids: Vec<i64>,
    mutation: u64,
}

impl FlatStore {
    pub fn open(
        fvecs_path: PathBuf,
        xids_path: PathBuf,
        mutation_path: PathBuf,
        d: usize,
    ) -> Result<Self> {
        let open_rw = |path: &Path| -> Result<File> {
            retry_interrupted(|| {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)
            })
            .map_err(|err| Error::io(path, err))
        };
        let fvecs = open_rw(&fvecs_path)?;
        let xids_file = open_rw(&xids_path)?;
        let mutation_file = open_rw(&mutation_path)?;

        let vec_bytes = read_file(&fvecs_path)?;
        let id_bytes = read_file(&xids_path)?;
        let line = d * FVECS_BYTES_PER_DIM;
        if vec_bytes.len() % line != 0 {
            return Err(Error::format(format!(
                "{}: length {} is not a multiple of the {line}-byte record",
                fvecs_path.display(),
                vec_bytes.len()
            )));
        }
        if id_bytes.len() % XID_BYTES != 0 {
            return Err(Error::format(format!(
                "{}: length {} is not a multiple of 8",
                xids_path.display(),
                id_bytes.len()
            )));
        }
        let nvec = vec_bytes.len() / line;
        let nid = id_bytes.len() / XID_BYTES;
        if nvec != nid {
            return Err(Error::format(format!(
                "base files disagree: {nvec} vectors vs {nid} ids"
            )));
        }

        let mutation_bytes = read_file(&mutation_path)?;
        let mutation = match mutation_bytes.len() {
            0 => 0,
            8 => u64::from_le_bytes(mutation_bytes[..8].try_into().unwrap()),
            other => {
                return Err(Error::format(format!(
                    "{}: expected 8 bytes, found {other}",
                    mutation_path.display()
                )))
            }
        };

        let mut store = Self {
            d,
            fvecs_path,
            xids_path,
            mutation_path,
            fvecs,
            xids_file,
            mutation_file,
            base: bytes_to_f32s(&vec_bytes),
            xids: bytes_to_i64s(&id_bytes),
            mutation,
        };
        if mutation_bytes.is_empty() {
            store.write_mutation()?;
        }
        Ok(store)
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn ntotal(&self) -> usize {
        self.xids.len()
    }

    pub fn mutation(&self) -> u64 {
        self.mutation
    }

    pub fn xids(&self) -> &[i64] {
        &self.xids
    }

    pub fn vectors(&self) -> &[f32] {
        &self.base
    }

    pub fn vector(&self, ordinal: usize) -> &[f32] {
        &self.base[ordinal * self.d..(ordinal + 1) * self.d]
    }

    /// Appends `n` records to both files and the in-memory mirror.
    pub fn append(&mut self, xb: &[f32], ids: &[i64]) -> Result<()> {
        debug_assert_eq!(xb.len(), ids.len() * self.d);
        self.fvecs
            .seek(SeekFrom::End(0))
            .and_then(|_| self.fvecs.write_all(&f32s_to_bytes(xb)))
            .and_then(|_| retry_interrupted(|| self.fvecs.sync_data()))
            .map_err(|err| Error::io(&self.fvecs_path, err))?;
        self.xids_file
            .seek(SeekFrom::End(0))
            .and_then(|_| self.xids_file.write_all(&i64s_to_bytes(ids)))
            .and_then(|_| retry_interrupted(|| self.xids_file.sync_data()))
            .map_err(|err| Error::io(&self.xids_path, err))?;
        self.base.extend_from_slice(xb);
        self.xids.extend_from_slice(ids);
        Ok(())
    }

    /// Stamps the record `-1` in memory and on disk without touching the
    /// mutation counter. Used when re-applying tombstones after a swap.
    pub fn stamp_tombstone(&mut self, ordinal: usize) -> Result<()> {
        self.xids[ordinal] = -1;
        self.xids_file
            .seek(SeekFrom::Start((ordinal * XID_BYTES) as u64))
            .and_then(|_| self.xids_file.write_all(&(-1i64).to_le_bytes()))
            .and_then(|_| self.xids_file.flush())
            .map_err(|err| Error::io(&self.xids_path, err))
    }

    /// Logical delete: tombstone plus a mutation bump.
    pub fn remove(&mut self, ordinal: usize) -> Result<()> {
        self.stamp_tombstone(ordinal)?;
        self.mutation += 1;
        self.write_mutation()
    }

    /// Overwrites the vector of an existing record in place; the resident
    /// index goes stale until the next sync.
    pub fn update_vector(&mut self, ordinal: usize, v: &[f32]) -> Result<()> {
        debug_assert_eq!(v.len(), self.d);
        self.fvecs
            .seek(SeekFrom::Start((ordinal * self.d * FVECS_BYTES_PER_DIM) as u64))
            .and_then(|_| self.fvecs.write_all(&f32s_to_bytes(v)))
            .and_then(|_| retry_interrupted(|| self.fvecs.sync_data()))
            .map_err(|err| Error::io(&self.fvecs_path, err))?;
        self.base[ordinal * self.d..(ordinal + 1) * self.d].copy_from_slice(v);
        Ok(())
    }

    /// Persists the counter. Best-effort durability: flushed, not fsynced.
    fn write_mutation(&mut self) -> Result<()> {
        self.mutation_file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.mutation_file.write_all(&self.mutation.to_le_bytes()))
            .and_then(|_| self.mutation_file.flush())
            .map_err(|err| Error::io(&self.mutation_path, err))
    }

    pub fn reset(&mut self) -> Result<()> {
        self.fvecs
            .set_len(0)
            .map_err(|err| Error::io(&self.fvecs_path, err))?;
        self.xids_file
            .set_len(0)
            .map_err(|err| Error::io(&self.xids_path, err))?;
        self.base.clear();
        self.xids.clear();
        self.mutation = 0;
        self.write_mutation()
    }
}

/// Slides live records down over tombstoned slots in a vector/id file
/// pair, truncating both to the surviving count. Two cursors: the write
/// cursor sits on the first hole, the read cursor on the next live record.
pub(crate) fn compact_base_files(fvecs_path: &Path, xids_path: &Path, d: usize) -> Result<usize> {
    let mut vec_bytes = read_file(fvecs_path)?;
    let mut xids = bytes_to_i64s(&read_file(xids_path)?);
    let line = d * FVECS_BYTES_PER_DIM;
    let n = xids.len();
    if vec_bytes.len() != n * line {
        return Err(Error::format(format!(
            "snapshot files disagree: {} vector bytes vs {n} ids",
            vec_bytes.len()
        )));
    }

    let mut write = 0usize;
    for read in 0..n {
        if xids[read] == -1 {
            continue;
        }
        if write != read {
            vec_bytes.copy_within(read * line..(read + 1) * line, write * line);
            xids[write] = xids[read];
        }
        write += 1;
    }

    let rewrite = |path: &Path, bytes: &[u8]| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| Error::io(path, err))?;
        file.write_all(bytes)
            .and_then(|_| file.set_len(bytes.len() as u64))
            .and_then(|_| retry_interrupted(|| file.sync_data()))
            .map_err(|err| Error::io(path, err))
    };
    rewrite(fvecs_path, &vec_bytes[..write * line])?;
    rewrite(xids_path, &i64s_to_bytes(&xids[..write]))?;
    Ok(write)
}

#[derive(Debug)]
struct FlatDiskInner {
    file: File,
    map: MmapMut,
    ntotal: usize,
    capacity: usize,
    /// Mirror of the on-file id region, rebuilt on open.
    ids: Vec<i64>,
}

/// Single-file memory-mapped flat store.
///
/// Layout: `"IxFD"` | d:i32 | ntotal:i64 | is_trained:i32 | metric:i32 |
/// (metric_arg:f32 when metric > 1) | capacity:u64 | capacity vector slots
/// | capacity id slots. The file always covers the full capacity; growth
/// doubles the capacity and relocates the id region behind the doubled
/// vector region.
#[derive(Debug)]
pub struct FlatDisk {
    path: PathBuf,
    d: usize,
    metric: MetricKind,
    metric_arg: f32,
    initial_capacity: usize,
    inner: RwLock<FlatDiskInner>,
}

impl FlatDisk {
    fn header_size(metric: MetricKind) -> usize {
        // magic + d + ntotal + is_trained + metric (+ metric_arg)
        4 + 4 + 8 + 4 + 4 + if metric.code() > 1 { 4 } else { 0 }
    }

    fn capacity_off(metric: MetricKind) -> usize {
        Self::header_size(metric)
    }

    fn xb_off(metric: MetricKind) -> usize {
        Self::header_size(metric) + 8
    }

    fn ids_off(metric: MetricKind, d: usize, capacity: usize) -> usize {
        Self::xb_off(metric) + d * FVECS_BYTES_PER_DIM * capacity
    }

    fn total_size(metric: MetricKind, d: usize, capacity: usize) -> usize {
        Self::ids_off(metric, d, capacity) + XID_BYTES * capacity
    }

    pub fn open(
        path: impl AsRef<Path>,
        d: usize,
        metric: MetricKind,
        metric_arg: f32,
        initial_capacity: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = retry_interrupted(|| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
        })
        .map_err(|err| Error::io(&path, err))?;
        let len = file
            .metadata()
            .map_err(|err| Error::io(&path, err))?
            .len() as usize;

        let initial_capacity = initial_capacity.max(1);
        let inner = if len == 0 {
            Self::create(&path, &file, d, metric, metric_arg, initial_capacity)?
        } else {
            Self::load(&path, &file, d, metric, metric_arg, len)?
        };
        Ok(Self {
            path,
            d,
            metric,
            metric_arg,
            initial_capacity,
            inner: RwLock::new(inner),
        })
    }

    fn create(
        path: &Path,
        file: &File,
        d: usize,
        metric: MetricKind,
        metric_arg: f32,
        capacity: usize,
    ) -> Result<FlatDiskInner> {
        let total = Self::total_size(metric, d, capacity);
        file.set_len(total as u64)
            .map_err(|err| Error::io(path, err))?;
        let mut map =
            unsafe { MmapMut::map_mut(file) }.map_err(|err| Error::io(path, err))?;
        map[0..4].copy_from_slice(DISK_MAGIC);
        map[4..8].copy_from_slice(&(d as i32).to_le_bytes());
        map[8..16].copy_from_slice(&0i64.to_le_bytes());
        map[16..20].copy_from_slice(&1i32.to_le_bytes());
        map[20..24].copy_from_slice(&metric.code().to_le_bytes());
        if metric.code() > 1 {
            map[24..28].copy_from_slice(&metric_arg.to_le_bytes());
        }
        let cap_off = Self::capacity_off(metric);
        map[cap_off..cap_off + 8].copy_from_slice(&(capacity as u64).to_le_bytes());
        map.flush().map_err(|err| Error::io(path, err))?;
        Ok(FlatDiskInner {
            file: file.try_clone().map_err(|err| Error::io(path, err))?,
            map,
            ntotal: 0,
            capacity,
            ids: Vec::new(),
        })
    }

    fn load(
        path: &Path,
        file: &File,
        d: usize,
        metric: MetricKind,
        _metric_arg: f32,
        len: usize,
    ) -> Result<FlatDiskInner> {
        let map = unsafe { MmapMut::map_mut(file) }.map_err(|err| Error::io(path, err))?;
        if len < Self::header_size(metric) + 8 || &map[0..4] != DISK_MAGIC {
            return Err(Error::format(format!(
                "{}: not an IxFD flat file",
                path.display()
            )));
        }
        let file_d = i32::from_le_bytes(map[4..8].try_into().unwrap()) as usize;
        if file_d != d {
            return Err(Error::format(format!(
                "{}: dimension mismatch, file has {file_d}, expected {d}",
                path.display()
            )));
        }
        let ntotal = i64::from_le_bytes(map[8..16].try_into().unwrap()) as usize;
        let file_metric = i32::from_le_bytes(map[20..24].try_into().unwrap());
        let file_metric = MetricKind::from_code(file_metric)?;
        if file_metric != metric {
            return Err(Error::format(format!(
                "{}: metric mismatch, file has {:?}, expected {:?}",
                path.display(),
                file_metric,
                metric
            )));
        }
        let cap_off = Self::capacity_off(metric);
        let capacity =
            u64::from_le_bytes(map[cap_off..cap_off + 8].try_into().unwrap()) as usize;
        if len != Self::total_size(metric, d, capacity) || ntotal > capacity {
            return Err(Error::format(format!(
                "{}: inconsistent size: len {len}, capacity {capacity}, ntotal {ntotal}",
                path.display()
            )));
        }
        let ids_off = Self::ids_off(metric, d, capacity);
        let ids = bytes_to_i64s(&map[ids_off..ids_off + ntotal * XID_BYTES]);
        Ok(FlatDiskInner {
            file: file.try_clone().map_err(|err| Error::io(path, err))?,
            map,
            ntotal,
            capacity,
            ids,
        })
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    pub fn ntotal(&self) -> usize {
        self.inner.read().ntotal
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity
    }

    /// Mapped vector region for the first `ntotal` records.
    ///
    /// The region starts at a 4-byte-aligned offset and the file format is
    /// little-endian, matching f32 layout on supported targets.
    fn xb_slice<'a>(&self, inner: &'a FlatDiskInner) -> &'a [f32] {
        let off = Self::xb_off(self.metric);
        unsafe {
            std::slice::from_raw_parts(
                inner.map.as_ptr().add(off) as *const f32,
                inner.ntotal * self.d,
            )
        }
    }

    fn write_ntotal(&self, inner: &mut FlatDiskInner) {
        let n = inner.ntotal as i64;
        inner.map[8..16].copy_from_slice(&n.to_le_bytes());
    }

    /// Doubles capacity until `ntotal + n` fits, relocating the id region
    /// behind the grown vector region.
    fn grow_for(&self, inner: &mut FlatDiskInner, n: usize) -> Result<()> {
        if inner.ntotal + n <= inner.capacity {
            return Ok(());
        }
        let mut new_capacity = inner.capacity;
        while inner.ntotal + n > new_capacity {
            new_capacity *= 2;
        }
        inner.map.flush().map_err(|err| Error::io(&self.path, err))?;
        let total = Self::total_size(self.metric, self.d, new_capacity);
        inner
            .file
            .set_len(total as u64)
            .map_err(|err| Error::io(&self.path, err))?;
        let map =
            unsafe { MmapMut::map_mut(&inner.file) }.map_err(|err| Error::io(&self.path, err))?;
        inner.map = map;
        let ids_off = Self::ids_off(self.metric, self.d, new_capacity);
        let id_bytes = i64s_to_bytes(&inner.ids);
        inner.map[ids_off..ids_off + id_bytes.len()].copy_from_slice(&id_bytes);
        let cap_off = Self::capacity_off(self.metric);
        inner.map[cap_off..cap_off + 8].copy_from_slice(&(new_capacity as u64).to_le_bytes());
        inner.capacity = new_capacity;
        tracing::debug!(
            path = %self.path.display(),
            capacity = new_capacity,
            "grew flat file"
        );
        inner.map.flush().map_err(|err| Error::io(&self.path, err))
    }

    pub fn reserve(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.write();
        self.grow_for(&mut inner, n)
    }

    pub fn add_with_ids(&self, xb: &[f32], ids: &[i64]) -> Result<()> {
        if xb.len() != ids.len() * self.d {
            return Err(Error::DimMismatch {
                expected: ids.len() * self.d,
                got: xb.len(),
            });
        }
        let n = ids.len();
        let mut inner = self.inner.write();
        self.grow_for(&mut inner, n)?;

        let xb_off = Self::xb_off(self.metric) + inner.ntotal * self.d * FVECS_BYTES_PER_DIM;
        inner.map[xb_off..xb_off + xb.len() * FVECS_BYTES_PER_DIM]
            .copy_from_slice(&f32s_to_bytes(xb));
        let ids_off = Self::ids_off(self.metric, self.d, inner.capacity)
            + inner.ntotal * XID_BYTES;
        inner.map[ids_off..ids_off + n * XID_BYTES].copy_from_slice(&i64s_to_bytes(ids));
        inner.ids.extend_from_slice(ids);
        inner.ntotal += n;
        self.write_ntotal(&mut inner);
        inner.map.flush().map_err(|err| Error::io(&self.path, err))
    }

    /// Removes every live record the selector matches by sliding later
    /// records left. Ordinals after the first removal shift down.
    pub fn remove_ids(&self, mut selector: impl FnMut(i64) -> bool) -> Result<usize> {
        let mut inner = self.inner.write();
        let line = self.d * FVECS_BYTES_PER_DIM;
        let xb_off = Self::xb_off(self.metric);
        let mut write = 0usize;
        for read in 0..inner.ntotal {
            let xid = inner.ids[read];
            if xid != -1 && selector(xid) {
                continue;
            }
            if write != read {
                inner
                    .map
                    .copy_within(xb_off + read * line..xb_off + (read + 1) * line, xb_off + write * line);
                inner.ids[write] = xid;
            }
            write += 1;
        }
        let removed = inner.ntotal - write;
        if removed > 0 {
            inner.ids.truncate(write);
            inner.ntotal = write;
            let ids_off = Self::ids_off(self.metric, self.d, inner.capacity);
            let id_bytes = i64s_to_bytes(&inner.ids);
            inner.map[ids_off..ids_off + id_bytes.len()].copy_from_slice(&id_bytes);
            self.write_ntotal(&mut inner);
            inner
                .map
                .flush()
                .map_err(|err| Error::io(&self.path, err))?;
        }
        Ok(removed)
    }

    pub fn search(
        &self,
        k: usize,
        xq: &[f32],
        top_vectors: bool,
        filters: Option<&[Option<&UidSet>]>,
        distances: &mut [f32],
        labels: &mut [i64],
    ) {
        let inner = self.inner.read();
        let req = KnnRequest {
            d: self.d,
            k,
            metric: self.metric,
            metric_arg: self.metric_arg,
            top_vectors,
            ids: Some(&inner.ids),
            filters,
            ordinal_labels: false,
        };
        knn_search(&req, xq, self.xb_slice(&inner), distances, labels);
    }

    /// Single-query scan for everything scoring within `radius`.
    pub fn range_search(&self, query: &[f32], radius: f32) -> Vec<(f32, i64)> {
        let inner = self.inner.read();
        let xb = self.xb_slice(&inner);
        let mut out = Vec::new();
        for ordinal in 0..inner.ntotal {
            let xid = inner.ids[ordinal];
            if xid == -1 {
                continue;
            }
            let score = metric::distance(
                self.metric,
                self.metric_arg,
                query,
                &xb[ordinal * self.d..(ordinal + 1) * self.d],
            );
            let within = if self.metric.higher_is_better() {
                score >= radius
            } else {
                score <= radius
            };
            if within {
                out.push((score, xid));
            }
        }
        out
    }

    pub fn reconstruct(&self, ordinal: usize, out: &mut [f32]) {
        let inner = self.inner.read();
        let xb = self.xb_slice(&inner);
        out.copy_from_slice(&xb[ordinal * self.d..(ordinal + 1) * self.d]);
    }

    pub fn compute_distance_subset(&self, query: &[f32], labels: &[i64], distances: &mut [f32]) {
        let inner = self.inner.read();
        let xb = self.xb_slice(&inner);
        for (slot, &label) in labels.iter().enumerate() {
            distances[slot] = if label < 0 || label as usize >= inner.ntotal {
                self.metric.worst()
            } else {
                let ordinal = label as usize;
                metric::distance(
                    self.metric,
                    self.metric_arg,
                    query,
                    &xb[ordinal * self.d..(ordinal + 1) * self.d],
                )
            };
        }
    }

    /// Snapshot of the whole table for artifact serialisation.
    pub fn to_flat_snapshot(&self) -> (FlatIndex, Vec<i64>) {
        let inner = self.inner.read();
        let mut flat = FlatIndex::new(self.d, self.metric, self.metric_arg);
        flat.add(self.xb_slice(&inner));
        (flat, inner.ids.clone())
    }

    /// Clears the table and re-truncates the file to the initial capacity.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.ntotal = 0;
        inner.ids.clear();
        inner.map.flush().map_err(|err| Error::io(&self.path, err))?;
        let total = Self::total_size(self.metric, self.d, self.initial_capacity);
        inner
            .file
            .set_len(total as u64)
            .map_err(|err| Error::io(&self.path, err))?;
        inner.map =
            unsafe { MmapMut::map_mut(&inner.file) }.map_err(|err| Error::io(&self.path, err))?;
        inner.capacity = self.initial_capacity;
        let cap_off = Self::capacity_off(self.metric);
        let cap = self.initial_capacity as u64;
        inner.map[cap_off..cap_off + 8].copy_from_slice(&cap.to_le_bytes());
        self.write_ntotal(&mut inner);
        inner.map.flush().map_err(|err| Error::io(&self.path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn disk_resize_doubles_and_relocates_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = tmp_path(&dir, "flat.ixfd");
        let d = 2;
        let disk = FlatDisk::open(&path, d, MetricKind::InnerProduct, 0.0, 4).unwrap();
        let xb: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let ids: Vec<i64> = (100..105).collect();
        disk.add_with_ids(&xb, &ids).unwrap();
        assert_eq!(disk.ntotal(), 5);
        assert_eq!(disk.capacity(), 8);
        let header = 4 + 4 + 8 + 4 + 4 + 8;
        let expected = header + 8 * (4 * d + 8);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            expected as u64,
            "file must cover header + capacity records"
        );
        // all five vectors readable after the id relocation
        let mut out = [0.0f32; 2];
        for i in 0..5 {
            disk.reconstruct(i, &mut out);
            assert_eq!(out, [2.0 * i as f32, 2.0 * i as f32 + 1.0]);
        }
        drop(disk);
        let reopened = FlatDisk::open(&path, d, MetricKind::InnerProduct, 0.0, 4).unwrap();
        assert_eq!(reopened.ntotal(), 5);
        assert_eq!(reopened.capacity(), 8);
        reopened.reconstruct(4, &mut out);
        assert_eq!(out, [8.0, 9.0]);
    }

    #[test]
    fn disk_search_and_slide_removal() {
        let dir = tempfile::tempdir().unwrap();
        let disk = FlatDisk::open(
            tmp_path(&dir, "flat.ixfd"),
            4,
            MetricKind::InnerProduct,
            0.0,
            16,
        )
        .unwrap();
        let xb = [
            1.0f32, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        ];
        disk.add_with_ids(&xb, &[1000, 1001, 1002]).unwrap();

        let mut dist = [0.0f32; 2];
        let mut labels = [0i64; 2];
        disk.search(2, &[1.0, 0.0, 0.0, 0.0], true, None, &mut dist, &mut labels);
        assert_eq!(labels[0], 1000);
        assert_eq!(dist[0], 1.0);

        let removed = disk.remove_ids(|xid| xid == 1001).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(disk.ntotal(), 2);
        disk.search(2, &[0.0, 1.0, 0.0, 0.0], true, None, &mut dist, &mut labels);
        assert!(!labels.contains(&1001));
        assert!(dist[0] < 1.0);
    }

    #[test]
    fn disk_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = tmp_path(&dir, "bogus.ixfd");
        std::fs::write(&path, b"definitely not a flat file, but long enough").unwrap();
        let err =
            FlatDisk::open(&path, 4, MetricKind::InnerProduct, 0.0, 4).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn disk_reset_restores_initial_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = tmp_path(&dir, "flat.ixfd");
        let disk = FlatDisk::open(&path, 2, MetricKind::L2, 0.0, 4).unwrap();
        let xb: Vec<f32> = (0..20).map(|i| i as f32).collect();
        let ids: Vec<i64> = (0..10).collect();
        disk.add_with_ids(&xb, &ids).unwrap();
        assert!(disk.capacity() > 4);
        disk.reset().unwrap();
        assert_eq!(disk.ntotal(), 0);
        assert_eq!(disk.capacity(), 4);
    }

    #[test]
    fn store_parity_is_validated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let fvecs = tmp_path(&dir, "base.fvecs");
        let xids = tmp_path(&dir, "base.xids");
        let mutation = tmp_path(&dir, "base.mutation");
        std::fs::write(&fvecs, f32s_to_bytes(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        std::fs::write(&xids, i64s_to_bytes(&[7])).unwrap();
        let err = FlatStore::open(fvecs, xids, mutation, 2).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn store_append_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fvecs = tmp_path(&dir, "base.fvecs");
        let xids = tmp_path(&dir, "base.xids");
        let mutation = tmp_path(&dir, "base.mutation");
        let mut store =
            FlatStore::open(fvecs.clone(), xids.clone(), mutation.clone(), 2).unwrap();
        store.append(&[1.0, 0.0, 0.0, 1.0], &[10, 11]).unwrap();
        assert_eq!(store.ntotal(), 2);
        store.remove(0).unwrap();
        assert_eq!(store.mutation(), 1);
        assert_eq!(store.xids(), &[-1, 11]);
        drop(store);

        let store = FlatStore::open(fvecs, xids, mutation, 2).unwrap();
        assert_eq!(store.ntotal(), 2);
        assert_eq!(store.xids(), &[-1, 11]);
        assert_eq!(store.mutation(), 1);
        assert_eq!(store.vector(1), &[0.0, 1.0]);
    }

    #[test]
    fn compaction_slides_survivors_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fvecs = tmp_path(&dir, "t.fvecs");
        let xids = tmp_path(&dir, "t.xids");
        let d = 2;
        let n = 10usize;
        let vecs: Vec<f32> = (0..n * d).map(|i| i as f32).collect();
        let ids: Vec<i64> = (0..n as i64)
            .map(|i| if i % 2 == 0 { 100 + i } else { -1 })
            .collect();
        std::fs::write(&fvecs, f32s_to_bytes(&vecs)).unwrap();
        std::fs::write(&xids, i64s_to_bytes(&ids)).unwrap();
        let live = compact_base_files(&fvecs, &xids, d).unwrap();
        assert_eq!(live, 5);
        let kept = bytes_to_i64s(&std::fs::read(&xids).unwrap());
        assert_eq!(kept, vec![100, 102, 104, 106, 108]);
        let vecs = bytes_to_f32s(&std::fs::read(&fvecs).unwrap());
        assert_eq!(vecs.len(), 5 * d);
        assert_eq!(&vecs[..2], &[0.0, 1.0]);
        assert_eq!(&vecs[2..4], &[4.0, 5.0]);
    }
}
