//! Binary wire format for a single shard (§6).
//!
//! Little-endian throughout: a fixed 64-byte header, an 8-byte-aligned id
//! table, the vector buffer, optional cosine norms, 8-byte-aligned levels,
//! and one adjacency block per layer. `encode`/`decode` are meant to be a
//! near-memcpy of the Index's own flat arrays, not a general-purpose
//! serialization format.

use crate::config::{Config, Metric};
use crate::error::{Error, Result};
use crate::index::{Index, Layer};

const MAGIC: u32 = 0x5748_4E53; // b"HNSW" read as a little-endian u32
const VERSION: u32 = 1;
const HEADER_LEN: usize = 64;

const FLAG_COSINE_NORMS: u8 = 1 << 0;
const FLAG_USE_HEURISTIC: u8 = 1 << 1;
const FLAG_KEEP_PRUNED: u8 = 1 << 2;

/// The fields `read_header` exposes without parsing the rest of the file
/// (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub dim: u32,
    pub count: u32,
    pub metric: Metric,
    pub m: u32,
}

fn pad_len(len: usize, align: usize) -> usize {
    let rem = len % align;
    if rem == 0 {
        0
    } else {
        align - rem
    }
}

fn push_padding(buf: &mut Vec<u8>, align: usize) {
    let pad = pad_len(buf.len(), align);
    buf.resize(buf.len() + pad, 0);
}

/// Encode `index` into a self-describing byte buffer (§6). Only the live
/// `count` prefix of every backing array is written, even though the Index
/// may have spare capacity.
pub fn encode(index: &Index) -> Vec<u8> {
    let count = index.count as usize;
    let dim = index.dim;

    let mut flags = 0u8;
    if index.metric.needs_norm() {
        flags |= FLAG_COSINE_NORMS;
    }
    if index.use_heuristic {
        flags |= FLAG_USE_HEURISTIC;
    }
    if index.keep_pruned_connections {
        flags |= FLAG_KEEP_PRUNED;
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + count * (dim * 4 + 16));

    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(dim as u32).to_le_bytes());
    buf.extend_from_slice(&(count as u32).to_le_bytes());
    buf.extend_from_slice(&index.max_level.to_le_bytes());
    buf.extend_from_slice(&index.entry_point.map(|id| id as i32).unwrap_or(-1).to_le_bytes());
    buf.extend_from_slice(&(index.m as u32).to_le_bytes());
    buf.extend_from_slice(&(index.m_max_0 as u32).to_le_bytes());
    buf.push(index.metric.tag());
    buf.push(flags);
    buf.extend_from_slice(&(index.ef_construction as u32).to_le_bytes());
    buf.extend_from_slice(&(index.ef_search as u32).to_le_bytes());
    buf.resize(HEADER_LEN, 0);
    debug_assert_eq!(buf.len(), HEADER_LEN);

    for i in 0..count {
        let ext = index.int_to_ext[i].as_bytes();
        buf.extend_from_slice(&(ext.len() as u32).to_le_bytes());
        buf.extend_from_slice(ext);
    }
    push_padding(&mut buf, 8);

    for f in &index.vectors[..count * dim] {
        buf.extend_from_slice(&f.to_le_bytes());
    }

    if index.metric.needs_norm() {
        for f in &index.norms[..count] {
            buf.extend_from_slice(&f.to_le_bytes());
        }
    }

    for &level in &index.levels[..count] {
        buf.push(level);
    }
    push_padding(&mut buf, 8);

    buf.extend_from_slice(&(index.layers.len() as u32).to_le_bytes());
    for (layer_index, layer) in index.layers.iter().enumerate() {
        buf.extend_from_slice(&(layer_index as u32).to_le_bytes());
        buf.extend_from_slice(&(count as u32).to_le_bytes());
        buf.extend_from_slice(&(layer.max_neighbors as u32).to_le_bytes());

        let counts = &layer.raw_neighbor_counts()[..count];
        buf.extend_from_slice(counts);
        push_padding(&mut buf, 4);

        let adjacency = &layer.raw_adjacency()[..count * layer.max_neighbors];
        for &id in adjacency {
            buf.extend_from_slice(&id.to_le_bytes());
        }
    }

    buf
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.bytes.len() {
            Err(Error::Truncated {
                expected: self.pos + n,
                found: self.bytes.len(),
            })
        } else {
            Ok(())
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes(b.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes(b.try_into().unwrap()))
    }

    fn align_to(&mut self, align: usize) -> Result<()> {
        let pad = pad_len(self.pos, align);
        self.take(pad)?;
        Ok(())
    }
}

/// Parse just the header (§4.8), without touching the rest of the buffer.
pub fn read_header(bytes: &[u8]) -> Result<Header> {
    let mut r = Reader::new(bytes);
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(Error::BadMagic);
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let dim = r.u32()?;
    let count = r.u32()?;
    let _max_level = r.i32()?;
    let _entry_point = r.i32()?;
    let m = r.u32()?;
    let _m_max_0 = r.u32()?;
    let metric_tag = r.u8()?;
    let metric = Metric::from_tag(metric_tag).ok_or(Error::BadMagic)?;
    Ok(Header {
        dim,
        count,
        metric,
        m,
    })
}

/// Strict inverse of [`encode`]: decode produces a **tight** Index
/// (`capacity = count`) with zero tombstones (§4.8).
pub fn decode(bytes: &[u8]) -> Result<Index> {
    let mut r = Reader::new(bytes);

    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(Error::BadMagic);
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let dim = r.u32()? as usize;
    let count = r.u32()? as usize;
    let max_level = r.i32()?;
    let entry_point_raw = r.i32()?;
    let m = r.u32()? as usize;
    let m_max_0 = r.u32()? as usize;
    let metric_tag = r.u8()?;
    let metric = Metric::from_tag(metric_tag).ok_or(Error::BadMagic)?;
    let flags = r.u8()?;
    let ef_construction = r.u32()? as usize;
    let ef_search = r.u32()? as usize;
    r.take(HEADER_LEN - r.pos)?; // reserved pad

    let use_heuristic = flags & FLAG_USE_HEURISTIC != 0;
    let keep_pruned_connections = flags & FLAG_KEEP_PRUNED != 0;
    let has_norms = flags & FLAG_COSINE_NORMS != 0;

    let mut int_to_ext = Vec::with_capacity(count);
    let mut ext_to_int = std::collections::HashMap::with_hasher(ahash::RandomState::new());
    for id in 0..count {
        let len = r.u32()? as usize;
        let raw = r.take(len)?;
        let ext = String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Truncated { expected: len, found: raw.len() })?;
        ext_to_int.insert(ext.clone(), id as u32);
        int_to_ext.push(ext);
    }
    r.align_to(8)?;

    let mut vectors = Vec::with_capacity(count * dim);
    for _ in 0..count * dim {
        vectors.push(r.f32()?);
    }

    let mut norms = vec![0.0f32; count];
    if has_norms {
        for slot in norms.iter_mut() {
            *slot = r.f32()?;
        }
    }

    let mut levels = Vec::with_capacity(count);
    for _ in 0..count {
        levels.push(r.u8()?);
    }
    r.align_to(8)?;

    let num_layers = r.u32()? as usize;
    let mut layers = Vec::with_capacity(num_layers);
    for _ in 0..num_layers {
        let _layer_index = r.u32()?;
        let node_count = r.u32()? as usize;
        let max_neighbors = r.u32()? as usize;
        if node_count != count {
            return Err(Error::Truncated {
                expected: count,
                found: node_count,
            });
        }

        let mut neighbor_counts = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            neighbor_counts.push(r.u8()?);
        }
        r.align_to(4)?;

        let mut adjacency = Vec::with_capacity(node_count * max_neighbors);
        for _ in 0..node_count * max_neighbors {
            adjacency.push(r.u32()?);
        }

        layers.push(Layer::from_raw(max_neighbors, adjacency, neighbor_counts));
    }

    let config = Config::new(dim)
        .with_metric(metric)
        .with_m(m)
        .with_m_max_0(m_max_0)
        .with_ef_construction(ef_construction)
        .with_ef_search(ef_search)
        .with_heuristic(use_heuristic)
        .with_keep_pruned_connections(keep_pruned_connections);

    let entry_point = if entry_point_raw < 0 {
        None
    } else {
        Some(entry_point_raw as u32)
    };

    Ok(Index::from_decoded(
        config,
        count as u32,
        max_level,
        entry_point,
        vectors,
        norms,
        levels,
        layers,
        int_to_ext,
        ext_to_int,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip_preserves_search_results() {
        let mut index = Index::new(Config::new(3).with_seed(1));
        index.insert("a", &[1.0, 0.0, 0.0]).unwrap();
        index.insert("b", &[0.0, 1.0, 0.0]).unwrap();
        index.insert("c", &[0.0, 0.0, 1.0]).unwrap();
        index.insert("d", &[0.9, 0.1, 0.0]).unwrap();

        let bytes = encode(&index);
        let mut decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.len(), index.len());
        let before = index.search(&[1.0, 0.0, 0.0], 3, None, None).unwrap();
        let after = decoded.search(&[1.0, 0.0, 0.0], 3, None, None).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn read_header_matches_encoded_fields() {
        let mut index = Index::new(Config::new(4).with_seed(2).with_metric(Metric::Cosine));
        for i in 0..10 {
            index.insert(format!("v{i}"), &[i as f32, 1.0, 0.0, 0.0]).unwrap();
        }
        let bytes = encode(&index);
        let header = read_header(&bytes).unwrap();
        assert_eq!(header.dim, 4);
        assert_eq!(header.count, 10);
        assert_eq!(header.metric, Metric::Cosine);
        assert_eq!(header.m, index.m() as u32);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = vec![0u8; 64];
        assert!(matches!(decode(&bytes), Err(Error::BadMagic)));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let mut index = Index::new(Config::new(2).with_seed(1));
        index.insert("a", &[1.0, 2.0]).unwrap();
        let bytes = encode(&index);
        let truncated = &bytes[..bytes.len() - 4];
        assert!(matches!(decode(truncated), Err(Error::Truncated { .. })));
    }

    #[test]
    fn utf8_ids_round_trip_bitwise() {
        let mut index = Index::new(Config::new(2).with_seed(1));
        index.insert("日本語", &[1.0, 2.0]).unwrap();
        index.insert("emoji-\u{1F389}", &[3.0, 4.0]).unwrap();
        let bytes = encode(&index);
        let decoded = decode(&bytes).unwrap();
        assert!(decoded.has("日本語"));
        assert!(decoded.has("emoji-\u{1F389}"));
        assert_eq!(decoded.get_vector("日本語"), Some(&[1.0, 2.0][..]));
        assert_eq!(decoded.get_vector("emoji-\u{1F389}"), Some(&[3.0, 4.0][..]));
    }
}
