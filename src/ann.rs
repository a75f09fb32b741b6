//! The auxiliary index behind the coordinator.
//!
//! A tagged enum instead of a virtual hierarchy: every variant answers the
//! same train/add/search/serialize capability set, and dispatch is a match.
//! Labels are insertion ordinals for all variants except `FlatDisk`, which
//! owns its id table and answers with xids directly.
//!
//! Serialised indexes ("artifacts") are a 16-byte framed header followed by
//! a bincode payload:
//!
//! ```text
//! magic:u32 "ANNX" | version:u16 | kind:u16 | payload_len:u32 | crc32:u32
//! ```

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;

use serde::Serialize;

use crate::bitmap::UidSet;
use crate::config::QueryParams;
use crate::error::{retry_interrupted, Error, Result};
use crate::flat::{FlatDisk, FlatIndex};
use crate::ivf::{IvfHnsw, IvfPq};
use crate::metric::MetricKind;

const ARTIFACT_MAGIC: u32 = 0x584E_4E41; // "ANNX"
const ARTIFACT_VERSION: u16 = 1;
const ARTIFACT_HEADER_BYTES: usize = 16;

const KIND_FLAT: u16 = 0;
const KIND_IVF_PQ: u16 = 2;
const KIND_IVF_HNSW: u16 = 3;

pub enum Ann {
    Flat(FlatIndex),
    FlatDisk(FlatDisk),
    IvfPq(IvfPq),
    IvfHnsw(IvfHnsw),
}

/// The recipe grammar the factory understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipe {
    Flat,
    IvfPq { nlist: usize, m: usize },
    IvfHnsw { nlist: usize, graph_m: usize },
}

impl Recipe {
    pub fn parse(recipe: &str) -> Result<Self> {
        let recipe = recipe.trim();
        if recipe == "Flat" {
            return Ok(Recipe::Flat);
        }
        let Some((head, tail)) = recipe.split_once(',') else {
            return Err(Error::format(format!("unrecognised recipe {recipe:?}")));
        };
        let head = head.trim();
        let tail = tail.trim();
        if let Some(rest) = head.strip_prefix("IVF") {
            if let Some((nlist_str, hnsw_str)) = rest.split_once("_HNSW") {
                if tail != "Flat" {
                    return Err(Error::format(format!(
                        "recipe {recipe:?}: graph-quantised lists must be Flat"
                    )));
                }
                let nlist = nlist_str
                    .parse()
                    .map_err(|_| Error::format(format!("recipe {recipe:?}: bad list count")))?;
                let graph_m = hnsw_str
                    .parse()
                    .map_err(|_| Error::format(format!("recipe {recipe:?}: bad graph degree")))?;
                return Ok(Recipe::IvfHnsw { nlist, graph_m });
            }
            let nlist = rest
                .parse()
                .map_err(|_| Error::format(format!("recipe {recipe:?}: bad list count")))?;
            let Some(m_str) = tail.strip_prefix("PQ") else {
                return Err(Error::format(format!(
                    "recipe {recipe:?}: expected a PQ code size"
                )));
            };
            let m = m_str
                .parse()
                .map_err(|_| Error::format(format!("recipe {recipe:?}: bad code size")))?;
            return Ok(Recipe::IvfPq { nlist, m });
        }
        Err(Error::format(format!("unrecognised recipe {recipe:?}")))
    }
}

impl Ann {
    /// Synthesises an untrained index from a recipe string.
    pub fn from_recipe(recipe: &str, d: usize, metric: MetricKind, metric_arg: f32) -> Result<Self> {
        match Recipe::parse(recipe)? {
            Recipe::Flat => Ok(Ann::Flat(FlatIndex::new(d, metric, metric_arg))),
            Recipe::IvfPq { nlist, m } => Ok(Ann::IvfPq(IvfPq::new(d, nlist, m, metric)?)),
            Recipe::IvfHnsw { nlist, graph_m } => {
                Ok(Ann::IvfHnsw(IvfHnsw::new(d, nlist, graph_m, metric)?))
            }
        }
    }

    pub fn d(&self) -> usize {
        match self {
            Ann::Flat(flat) => flat.d(),
            Ann::FlatDisk(disk) => disk.d(),
            Ann::IvfPq(ivf) => ivf.d(),
            Ann::IvfHnsw(ivf) => ivf.d(),
        }
    }

    pub fn ntotal(&self) -> usize {
        match self {
            Ann::Flat(flat) => flat.ntotal(),
            Ann::FlatDisk(disk) => disk.ntotal(),
            Ann::IvfPq(ivf) => ivf.ntotal(),
            Ann::IvfHnsw(ivf) => ivf.ntotal(),
        }
    }

    pub fn ntrain(&self) -> usize {
        match self {
            Ann::Flat(_) | Ann::FlatDisk(_) => 0,
            Ann::IvfPq(ivf) => ivf.ntrain(),
            Ann::IvfHnsw(ivf) => ivf.ntrain(),
        }
    }

    pub fn is_trained(&self) -> bool {
        match self {
            Ann::Flat(_) | Ann::FlatDisk(_) => true,
            Ann::IvfPq(ivf) => ivf.is_trained(),
            Ann::IvfHnsw(ivf) => ivf.is_trained(),
        }
    }

    /// Training is a no-op for the exhaustive variants.
    pub fn train(&mut self, xs: &[f32]) -> Result<()> {
        match self {
            Ann::Flat(_) | Ann::FlatDisk(_) => Ok(()),
            Ann::IvfPq(ivf) => ivf.train(xs),
            Ann::IvfHnsw(ivf) => ivf.train(xs),
        }
    }

    /// Appends vectors; their labels are the next insertion ordinals.
    pub fn add(&mut self, xb: &[f32]) -> Result<()> {
        match self {
            Ann::Flat(flat) => {
                flat.add(xb);
                Ok(())
            }
            Ann::FlatDisk(disk) => {
                let start = disk.ntotal() as i64;
                let n = xb.len() / disk.d();
                let ids: Vec<i64> = (start..start + n as i64).collect();
                disk.add_with_ids(xb, &ids)
            }
            Ann::IvfPq(ivf) => ivf.add(xb),
            Ann::IvfHnsw(ivf) => ivf.add(xb),
        }
    }

    /// Searches the index. `ids` maps ordinals to xids for tombstone and
    /// uid-filter checks; labels come back as ordinals (`FlatDisk` answers
    /// with the xids of its own id table instead).
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
        match self {
            Ann::Flat(flat) => {
                flat.search_ordinals(k, xq, ids, filters, distances, labels);
                Ok(())
            }
            Ann::FlatDisk(disk) => {
                disk.search(k, xq, true, filters, distances, labels);
                Ok(())
            }
            Ann::IvfPq(ivf) => ivf.search(k, xq, params, ids, filters, distances, labels),
            Ann::IvfHnsw(ivf) => ivf.search(k, xq, params, ids, filters, distances, labels),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|err| Error::format(format!("index serialise: {err}")))
}

/// Serialises the index to `path`, written to a side file and renamed in.
pub fn write_artifact(path: &Path, ann: &Ann) -> Result<()> {
    let (kind, bytes) = match ann {
        Ann::Flat(flat) => (KIND_FLAT, encode(flat)?),
        Ann::FlatDisk(disk) => {
            let (flat, _ids) = disk.to_flat_snapshot();
            (KIND_FLAT, encode(&flat)?)
        }
        Ann::IvfPq(ivf) => (KIND_IVF_PQ, encode(ivf)?),
        Ann::IvfHnsw(ivf) => (KIND_IVF_HNSW, encode(ivf)?),
    };
    write_payload(path, kind, &bytes)
}

fn write_payload(path: &Path, kind: u16, bytes: &[u8]) -> Result<()> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    let crc = hasher.finalize();

    let mut header = [0u8; ARTIFACT_HEADER_BYTES];
    header[0..4].copy_from_slice(&ARTIFACT_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&ARTIFACT_VERSION.to_le_bytes());
    header[6..8].copy_from_slice(&kind.to_le_bytes());
    header[8..12].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    header[12..16].copy_from_slice(&crc.to_le_bytes());

    let tmp = path.with_extension("index.tmp");
    let mut file = retry_interrupted(|| {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
    })
    .map_err(|err| Error::io(&tmp, err))?;
    file.write_all(&header)
        .and_then(|_| file.write_all(bytes))
        .and_then(|_| retry_interrupted(|| file.sync_data()))
        .map_err(|err| Error::io(&tmp, err))?;
    std::fs::rename(&tmp, path).map_err(|err| Error::io(path, err))
}

/// Reads an artifact back. Graph-quantised indexes rebuild their coarse
/// graph before returning.
pub fn read_artifact(path: &Path) -> Result<Ann> {
    let mut file = retry_interrupted(|| std::fs::File::open(path))
        .map_err(|err| Error::io(path, err))?;
    let mut header = [0u8; ARTIFACT_HEADER_BYTES];
    file.read_exact(&mut header)
        .map_err(|err| Error::io(path, err))?;
    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != ARTIFACT_MAGIC {
        return Err(Error::format(format!(
            "{}: not an index artifact",
            path.display()
        )));
    }
    let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
    if version != ARTIFACT_VERSION {
        return Err(Error::format(format!(
            "{}: unsupported artifact version {version}",
            path.display()
        )));
    }
    let kind = u16::from_le_bytes(header[6..8].try_into().unwrap());
    let len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(header[12..16].try_into().unwrap());
    let mut bytes = vec![0u8; len];
    file.read_exact(&mut bytes)
        .map_err(|err| Error::io(path, err))?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes);
    if hasher.finalize() != crc {
        return Err(Error::format(format!(
            "{}: artifact checksum mismatch",
            path.display()
        )));
    }
    let decode_err =
        |err: bincode::Error| Error::format(format!("{}: artifact decode: {err}", path.display()));
    match kind {
        KIND_FLAT => Ok(Ann::Flat(bincode::deserialize(&bytes).map_err(decode_err)?)),
        KIND_IVF_PQ => Ok(Ann::IvfPq(bincode::deserialize(&bytes).map_err(decode_err)?)),
        KIND_IVF_HNSW => {
            let mut ivf: IvfHnsw = bincode::deserialize(&bytes).map_err(decode_err)?;
            ivf.rebuild_graph();
            Ok(Ann::IvfHnsw(ivf))
        }
        other => Err(Error::format(format!(
            "{}: unknown artifact kind {other}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn recipe_grammar() {
        assert_eq!(Recipe::parse("Flat").unwrap(), Recipe::Flat);
        assert_eq!(
            Recipe::parse("IVF4096,PQ32").unwrap(),
            Recipe::IvfPq {
                nlist: 4096,
                m: 32
            }
        );
        assert_eq!(
            Recipe::parse("IVF1024_HNSW32,Flat").unwrap(),
            Recipe::IvfHnsw {
                nlist: 1024,
                graph_m: 32
            }
        );
        assert!(Recipe::parse("HNSW32").is_err());
        assert!(Recipe::parse("IVF16,Flat").is_err());
        assert!(Recipe::parse("IVFx,PQ8").is_err());
    }

    #[test]
    fn artifact_round_trip_preserves_search_results() {
        let d = 8;
        let mut rng = StdRng::seed_from_u64(21);
        let xs: Vec<f32> = (0..400 * d).map(|_| rng.gen::<f32>()).collect();
        let mut ann = Ann::from_recipe("IVF4,PQ2", d, MetricKind::L2, 0.0).unwrap();
        ann.train(&xs).unwrap();
        ann.add(&xs).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.index");
        write_artifact(&path, &ann).unwrap();
        let back = read_artifact(&path).unwrap();
        assert_eq!(back.ntotal(), 400);
        assert!(back.is_trained());

        let params = QueryParams::parse("nprobe=4");
        let mut d1 = vec![0.0f32; 5];
        let mut l1 = vec![0i64; 5];
        let mut d2 = vec![0.0f32; 5];
        let mut l2 = vec![0i64; 5];
        ann.search(5, &xs[..d], &params, None, None, &mut d1, &mut l1)
            .unwrap();
        back.search(5, &xs[..d], &params, None, None, &mut d2, &mut l2)
            .unwrap();
        assert_eq!(l1, l2);
    }

    #[test]
    fn flat_disk_variant_dispatches_and_dumps_as_flat() {
        let dir = tempfile::tempdir().unwrap();
        let disk = FlatDisk::open(
            dir.path().join("store.ixfd"),
            2,
            MetricKind::InnerProduct,
            0.0,
            8,
        )
        .unwrap();
        let mut ann = Ann::FlatDisk(disk);
        assert!(ann.is_trained());
        ann.add(&[1.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(ann.ntotal(), 2);

        let params = QueryParams::default();
        let mut dist = [0.0f32; 1];
        let mut labels = [0i64; 1];
        ann.search(1, &[1.0, 0.0], &params, None, None, &mut dist, &mut labels)
            .unwrap();
        assert_eq!(labels[0], 0, "flat-disk labels are its own id table");

        let path = dir.path().join("snap.index");
        write_artifact(&path, &ann).unwrap();
        let back = read_artifact(&path).unwrap();
        assert!(matches!(back, Ann::Flat(_)), "disk snapshots dump as flat");
        assert_eq!(back.ntotal(), 2);
    }

    #[test]
    fn corrupted_artifact_is_rejected() {
        let d = 4;
        let ann = Ann::Flat(FlatIndex::new(d, MetricKind::InnerProduct, 0.0));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.index");
        write_artifact(&path, &ann).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_artifact(&path), Err(Error::Format(_))));
    }
}
