//! Merkle roots over workspace snapshots
//!
//! Each leaf commits to one `(path, content hash)` pair, in path order, so
//! two snapshots share a root exactly when they hold the same files.

use crate::hash::ContentHash;
use crate::path::WorkspacePath;
use rs_merkle::{Hasher, MerkleTree as RsMerkleTree};

/// Merkle tree over the files of a snapshot
pub struct WorkspaceMerkleTree {
    paths: Vec<WorkspacePath>,
    leaves: Vec<[u8; 32]>,
    inner: RsMerkleTree<Blake3Hasher>,
}

impl std::fmt::Debug for WorkspaceMerkleTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceMerkleTree")
            .field("leaf_count", &self.leaf_count())
            .field("root", &self.root())
            .finish()
    }
}

impl WorkspaceMerkleTree {
    /// Build from `(path, hash)` entries; entries must already be path-sorted
    #[must_use]
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = (&'a WorkspacePath, &'a ContentHash)>,
    ) -> Self {
        let (paths, leaves): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .map(|(path, hash)| (path.clone(), leaf_hash(path, hash)))
            .unzip();
        let inner = RsMerkleTree::from_leaves(&leaves);
        Self { paths, leaves, inner }
    }

    /// Root hash; zero for an empty workspace
    #[inline]
    #[must_use]
    pub fn root(&self) -> ContentHash {
        self.inner.root().map(ContentHash::new).unwrap_or_default()
    }

    /// Number of files committed to
    #[inline]
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Inclusion proof for `path`, if present
    #[must_use]
    pub fn prove(&self, path: &WorkspacePath) -> Option<InclusionProof> {
        let index = self.paths.binary_search(path).ok()?;
        Some(InclusionProof {
            index,
            total: self.leaves.len(),
            inner: self.inner.proof(&[index]),
        })
    }
}

/// Proof that a file with a given hash is part of a snapshot root
pub struct InclusionProof {
    index: usize,
    total: usize,
    inner: rs_merkle::MerkleProof<Blake3Hasher>,
}

impl std::fmt::Debug for InclusionProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InclusionProof")
            .field("index", &self.index)
            .field("total", &self.total)
            .finish()
    }
}

impl InclusionProof {
    /// Check the proof against `root`
    #[must_use]
    pub fn verify(&self, root: ContentHash, path: &WorkspacePath, hash: &ContentHash) -> bool {
        self.inner.verify(
            *root.as_bytes(),
            &[self.index],
            &[leaf_hash(path, hash)],
            self.total,
        )
    }
}

fn leaf_hash(path: &WorkspacePath, hash: &ContentHash) -> [u8; 32] {
    *ContentHash::compute_parts([path.as_str().as_bytes(), hash.as_bytes().as_slice()]).as_bytes()
}

/// Blake3 hasher adapter for rs_merkle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blake3Hasher;

impl Hasher for Blake3Hasher {
    type Hash = [u8; 32];

    #[inline]
    fn hash(data: &[u8]) -> Self::Hash {
        *blake3::hash(data).as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize) -> Vec<(WorkspacePath, ContentHash)> {
        (0..n)
            .map(|i| {
                (
                    WorkspacePath::new(format!("src/f{i:03}.ts")).unwrap(),
                    ContentHash::compute(i.to_string().as_bytes()),
                )
            })
            .collect()
    }

    fn tree(entries: &[(WorkspacePath, ContentHash)]) -> WorkspaceMerkleTree {
        WorkspaceMerkleTree::from_entries(entries.iter().map(|(p, h)| (p, h)))
    }

    #[test]
    fn empty_root_is_zero() {
        assert!(tree(&[]).root().is_zero());
    }

    #[test]
    fn root_depends_on_paths_and_content() {
        let base = entries(4);
        let mut renamed = base.clone();
        renamed[0].0 = WorkspacePath::new("src/other.ts").unwrap();
        let mut edited = base.clone();
        edited[1].1 = ContentHash::compute(b"edited");

        assert_eq!(tree(&base).root(), tree(&base).root());
        assert_ne!(tree(&base).root(), tree(&renamed).root());
        assert_ne!(tree(&base).root(), tree(&edited).root());
    }

    #[test]
    fn inclusion_proof_verifies() {
        let base = entries(5);
        let t = tree(&base);
        let (path, hash) = &base[3];
        let proof = t.prove(path).unwrap();

        assert!(proof.verify(t.root(), path, hash));
        assert!(!proof.verify(t.root(), path, &ContentHash::compute(b"forged")));
        assert!(t.prove(&WorkspacePath::new("missing.ts").unwrap()).is_none());
    }
}
