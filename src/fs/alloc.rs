//! Advisory in-use tracking and the collision-aware block allocator.
//!
//! There is no on-disk free map to trust. The tracker only remembers what
//! this mount has already proven (a set bit means a prior successful
//! decrypt); a clear bit proves nothing, so the allocator must still check
//! candidate blocks' raw tags against every ancestor directory of the
//! target before handing them out.

use bitmaps::Bitmap;

use crate::crypto;
use crate::fs::block::BlockDev;
use crate::fs::path;
use crate::param::TAG_SIZE;

const CHUNK: usize = 1024;

/// Bit-per-block map, all clear at mount, plus the optional per-block
/// owner names backing the `/bloc/` view.
pub struct BlockMap {
    bits: Vec<Bitmap<CHUNK>>,
    used: u64,
    owners: Option<Vec<Option<String>>>,
}

impl BlockMap {
    pub fn new(blocks: u64, track_owners: bool) -> Self {
        let chunks = (blocks as usize + CHUNK - 1) / CHUNK;
        Self {
            bits: vec![Bitmap::new(); chunks],
            used: 0,
            owners: if track_owners {
                Some(vec![None; blocks as usize])
            } else {
                None
            },
        }
    }

    pub fn get(&self, id: u64) -> bool {
        self.bits[id as usize / CHUNK].get(id as usize % CHUNK)
    }

    /// Mark `id` in use. Returns true when the bit was newly set, which is
    /// what failure rollback must undo.
    pub fn set(&mut self, id: u64, owner: Option<&str>) -> bool {
        let was = self.bits[id as usize / CHUNK].set(id as usize % CHUNK, true);
        if !was {
            self.used += 1;
        }
        if let (Some(owners), Some(name)) = (self.owners.as_mut(), owner) {
            owners[id as usize] = Some(name.to_owned());
        }
        !was
    }

    pub fn clear(&mut self, id: u64) {
        let was = self.bits[id as usize / CHUNK].set(id as usize % CHUNK, false);
        if was {
            self.used -= 1;
        }
        if let Some(owners) = self.owners.as_mut() {
            owners[id as usize] = None;
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn owner(&self, id: u64) -> Option<&str> {
        self.owners.as_ref()?.get(id as usize)?.as_deref()
    }

    /// In-use blocks with a recorded owner, ascending.
    pub fn owned(&self) -> Vec<(u64, &str)> {
        match self.owners.as_ref() {
            Some(owners) => owners
                .iter()
                .enumerate()
                .filter_map(|(i, o)| Some((i as u64, o.as_deref()?)))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Whether block `id` must not be allocated for a file under `dir`:
/// superblock, already tracked, or raw-tagged as belonging to `dir` or any
/// of its ancestors. A tag match is remembered in the tracker.
fn in_use(dev: &BlockDev, map: &mut BlockMap, id: u64, ancestor_tags: &[[u8; TAG_SIZE]]) -> bool {
    let norm = dev.normalize(id);
    if norm == 0 {
        return true;
    }
    if map.get(norm) {
        return true;
    }
    let raw = match dev.raw_tag(norm) {
        Some(raw) => raw,
        None => return true,
    };
    for tag in ancestor_tags {
        if raw == &tag[..] {
            // belongs to a file closer to the root; remember that
            map.set(norm, None);
            return true;
        }
    }
    false
}

/// Pick a block for a file under `dir`: a random unreduced index whose
/// block collides with no ancestor directory. Marks the pick in the
/// tracker and returns it untouched, or `None` once as many candidates as
/// the file system has blocks have been rejected.
pub fn assign(dev: &BlockDev, map: &mut BlockMap, dir: &str, owner: Option<&str>) -> Option<u64> {
    let ancestor_tags: Vec<[u8; TAG_SIZE]> = path::ancestors(dir)
        .iter()
        .map(|a| crypto::hash(&[a.as_bytes()]))
        .collect();
    for _ in 0..dev.blocks() {
        let id = crypto::random_u64();
        if !in_use(dev, map, id, &ancestor_tags) {
            map.set(dev.normalize(id), owner);
            return Some(id);
        }
    }
    log::warn!("allocator exhausted after {} attempts", dev.blocks());
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_and_rolls_back() {
        let mut map = BlockMap::new(4096, true);
        assert!(map.set(17, Some("/a/x")));
        assert!(!map.set(17, None), "second set is not new");
        assert_eq!(map.used(), 1);
        assert_eq!(map.owner(17), Some("/a/x"));
        map.clear(17);
        assert_eq!(map.used(), 0);
        assert!(map.owner(17).is_none());
        assert_eq!(map.owned().len(), 0);
    }

    #[test]
    fn chunk_boundaries() {
        let mut map = BlockMap::new(3000, false);
        for id in &[0u64, 1023, 1024, 2999] {
            assert!(map.set(*id, None));
            assert!(map.get(*id));
        }
        assert_eq!(map.used(), 4);
    }
}
