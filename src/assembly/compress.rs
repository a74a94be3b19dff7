// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Assembly, Bound};
use crate::{
    checksum::Checksum,
    clade::{Arena, Clade},
    coding::{Decode, DecodeError, Encode, EncodeError},
    context::Context,
    format_version::{self, FormatVersion},
    histogram::LeafId,
    HashMap, HashSet,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{Read, Write},
    sync::Arc,
};
use varint_rs::{VarintReader, VarintWriter};

/// Deepest tree nesting a payload may declare; bounds decoder recursion
const MAX_TREE_DEPTH: u32 = 10_000;

/// Skeleton of a built clade with leaves referred to by rank.
///
/// This is what compressed assemblies and save-archive records carry; it is
/// decoupled from both the clade arena and the raw leaf names.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TreeShape {
    /// 1-based leaf rank
    Leaf(u32),

    /// Internal node
    Node(Vec<TreeShape>),
}

impl TreeShape {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::Leaf(rank) => {
                writer.write_u8(0)?;
                writer.write_u32_varint(*rank)?;
            }
            Self::Node(children) => {
                writer.write_u8(1)?;

                #[expect(clippy::cast_possible_truncation, reason = "child counts are small")]
                writer.write_u32_varint(children.len() as u32)?;

                for child in children {
                    child.encode_into(writer)?;
                }
            }
        }
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R, depth: u32) -> Result<Self, DecodeError> {
        if depth > MAX_TREE_DEPTH {
            return Err(DecodeError::InvalidHeader("tree nesting too deep"));
        }

        match reader.read_u8()? {
            0 => Ok(Self::Leaf(reader.read_u32_varint()?)),
            1 => {
                let count = reader.read_u32_varint()?;
                if count < 2 {
                    return Err(DecodeError::InvalidHeader(
                        "internal node with fewer than two children",
                    ));
                }

                let mut children = Vec::with_capacity(count.min(1_024) as usize);
                for _ in 0..count {
                    children.push(Self::decode_from(reader, depth + 1)?);
                }
                Ok(Self::Node(children))
            }
            tag => Err(DecodeError::InvalidTag(("TreeShape", tag))),
        }
    }
}

/// A serialized assembly: score, bounds and clade skeletons behind a
/// versioned header with an xxh3 trailer.
///
/// The score summary is available without decoding the clade section, so
/// spill-reload acceptance decisions stay cheap.
#[derive(Clone, Debug)]
pub struct CompressedAssembly {
    score: f64,
    best_case: f64,
    nodes_left: u32,
    bytes: Box<[u8]>,
}

impl CompressedAssembly {
    #[must_use]
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Encoded best case; `-inf` when the branch was unreachable.
    #[must_use]
    pub fn best_case(&self) -> f64 {
        self.best_case
    }

    #[must_use]
    pub fn nodes_left(&self) -> u32 {
        self.nodes_left
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn from_parts(
        score: f64,
        best_case: f64,
        nodes_left: u32,
        clades: &[TreeShape],
    ) -> Self {
        let mut bytes = vec![];

        #[expect(clippy::expect_used, reason = "writes to a Vec cannot fail")]
        {
            format_version::write_header(&mut bytes, FormatVersion::V0).expect("cannot fail");
            bytes.write_f64::<LittleEndian>(score).expect("cannot fail");
            bytes
                .write_f64::<LittleEndian>(best_case)
                .expect("cannot fail");
            bytes.write_u32_varint(nodes_left).expect("cannot fail");

            #[expect(clippy::cast_possible_truncation, reason = "clade counts are small")]
            bytes
                .write_u32_varint(clades.len() as u32)
                .expect("cannot fail");

            for clade in clades {
                clade.encode_into(&mut bytes).expect("cannot fail");
            }

            let checksum = Checksum::of(&bytes);
            bytes
                .write_u64::<LittleEndian>(checksum.into_u64())
                .expect("cannot fail");
        }

        Self {
            score,
            best_case,
            nodes_left,
            bytes: bytes.into(),
        }
    }

    /// Validates a raw payload (header, version, checksum) and extracts the
    /// score summary.
    pub fn from_bytes(bytes: Vec<u8>) -> crate::Result<Self> {
        let Some(body_len) = bytes.len().checked_sub(8) else {
            return Err(DecodeError::Truncated.into());
        };

        let (body, trailer) = bytes.split_at(body_len);

        let mut trailer_reader = trailer;
        let expected = Checksum::from_raw(trailer_reader.read_u64::<LittleEndian>()?);
        Checksum::of(body).check(expected)?;

        let mut reader = body;
        format_version::read_header(&mut reader)?;
        let score = reader.read_f64::<LittleEndian>()?;
        let best_case = reader.read_f64::<LittleEndian>()?;
        let nodes_left = reader.read_u32_varint()?;

        Ok(Self {
            score,
            best_case,
            nodes_left,
            bytes: bytes.into(),
        })
    }

    /// Decodes the clade section.
    pub fn shapes(&self) -> crate::Result<Vec<TreeShape>> {
        let Some(body_len) = self.bytes.len().checked_sub(8) else {
            return Err(DecodeError::Truncated.into());
        };

        #[expect(clippy::indexing_slicing, reason = "bounds checked above")]
        let mut reader = &self.bytes[..body_len];

        format_version::read_header(&mut reader)?;
        reader.read_f64::<LittleEndian>().map_err(DecodeError::Io)?;
        reader.read_f64::<LittleEndian>().map_err(DecodeError::Io)?;
        reader.read_u32_varint().map_err(DecodeError::Io)?;

        let count = reader.read_u32_varint().map_err(DecodeError::Io)?;
        let mut shapes = Vec::with_capacity(count.min(1_024) as usize);
        for _ in 0..count {
            shapes.push(TreeShape::decode_from(&mut reader, 0)?);
        }
        Ok(shapes)
    }
}

impl Encode for CompressedAssembly {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&self.bytes)?;
        Ok(())
    }
}

impl Decode for CompressedAssembly {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut bytes = vec![];
        reader.read_to_end(&mut bytes)?;

        Self::from_bytes(bytes).map_err(|e| match e {
            crate::Error::Decode(e) => e,
            _ => DecodeError::InvalidHeader("payload validation failed"),
        })
    }
}

fn shape_of(clade: &Clade) -> TreeShape {
    if let Some(&leaf) = clade.leaves().first() {
        if clade.is_leaf() {
            return TreeShape::Leaf(leaf.rank());
        }
    }

    TreeShape::Node(clade.children().iter().map(shape_of).collect())
}

fn clade_from_shape(
    shape: &TreeShape,
    ctx: &Context,
    arena: &mut Arena,
) -> crate::Result<Clade> {
    match shape {
        TreeShape::Leaf(rank) => {
            #[expect(clippy::cast_possible_truncation, reason = "leaf counts are small")]
            let leaf_count = ctx.leaf_count() as u32;

            if *rank == 0 || *rank > leaf_count {
                return Err(DecodeError::InvalidHeader("leaf rank out of range").into());
            }
            Ok(arena.leaf(LeafId::from_rank(*rank)))
        }
        TreeShape::Node(children) => {
            let children = children
                .iter()
                .map(|c| clade_from_shape(c, ctx, arena))
                .collect::<crate::Result<Vec<_>>>()?;
            Ok(arena.join(children))
        }
    }
}

impl Assembly {
    /// Serializes this assembly into its compact transportable form.
    pub fn compress(&mut self) -> CompressedAssembly {
        let best_case = match self.best_case() {
            Bound::Reachable(score) => score,
            Bound::Unreachable => f64::NEG_INFINITY,
        };
        let nodes_left = self.nodes_left_to_build();

        let shapes: Vec<TreeShape> = self.built_clades().iter().map(shape_of).collect();

        CompressedAssembly::from_parts(self.score(), best_case, nodes_left, &shapes)
    }

    /// Rebuilds an assembly from its compact form.
    ///
    /// Derived state is recomputed from the clade skeletons; the live
    /// constraint subset is rebuilt from scratch.
    pub fn uncompress(
        compressed: &CompressedAssembly,
        ctx: &Arc<Context>,
        arena: &mut Arena,
    ) -> crate::Result<Self> {
        let shapes = compressed.shapes()?;

        let built_clades = shapes
            .iter()
            .map(|s| clade_from_shape(s, ctx, arena))
            .collect::<crate::Result<Vec<Clade>>>()?;

        let mut distances_to_root: HashMap<LeafId, u32> = HashMap::default();
        let mut pairs_accounted_for: HashSet<crate::histogram::LeafPair> = HashSet::default();
        for clade in &built_clades {
            for (leaf, depth) in clade.leaf_depths() {
                distances_to_root.insert(leaf, depth);
            }
            let leaves = clade.leaves();
            for (i, &a) in leaves.iter().enumerate() {
                for &b in leaves.iter().skip(i + 1) {
                    pairs_accounted_for.insert(crate::histogram::LeafPair::new(a, b));
                }
            }
        }

        let free_leaves: HashSet<LeafId> = ctx
            .leaves()
            .filter(|&leaf| !built_clades.iter().any(|c| c.contains(leaf)))
            .collect();

        let bound = if compressed.best_case() == f64::NEG_INFINITY {
            Bound::Unreachable
        } else {
            Bound::Reachable(compressed.best_case())
        };

        let mut asm = Self {
            ctx: ctx.clone(),
            built_clades,
            free_leaves,
            constraint_idx: vec![],
            score: compressed.score(),
            distances_to_root,
            pairs_accounted_for,
            cached_best_case: Some(bound),
        };
        asm.rebuild_constraint_idx();

        debug_assert!(asm.leaf_partition_holds());
        debug_assert_eq!(compressed.nodes_left(), asm.nodes_left_to_build());

        Ok(asm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Extended, encountered::LocalEncountered, histogram::PairHistogram,
    };

    fn three_leaves() -> Arc<Context> {
        Arc::new(
            Context::from_histograms(
                &[
                    PairHistogram::new("a", "b", vec![(1, 0.9), (2, 0.1)]),
                    PairHistogram::new("b", "c", vec![(1, 0.1), (2, 0.9)]),
                    PairHistogram::new("a", "c", vec![(1, 0.1), (2, 0.9)]),
                ],
                1.0,
                0.01,
            )
            .expect("histograms should be valid"),
        )
    }

    #[test]
    fn compress_uncompress_roundtrip() -> crate::Result<()> {
        let ctx = three_leaves();
        let mut arena = Arena::new();
        let enc = LocalEncountered::new();

        let Extended::Children(children) =
            Assembly::seed(&ctx).generate_extensions(&mut arena, &enc, None)
        else {
            panic!("seed should expand");
        };

        for mut child in children {
            let compressed = child.compress();
            let restored = Assembly::uncompress(&compressed, &ctx, &mut arena)?;

            assert_eq!(child.built_clades(), restored.built_clades());
            assert_eq!(child.score(), restored.score());
            assert_eq!(child.nodes_left_to_build(), restored.nodes_left_to_build());

            let mut restored = restored;
            assert_eq!(child.best_case(), restored.best_case());
        }

        Ok(())
    }

    #[test]
    fn payload_validates_checksum() {
        let ctx = three_leaves();
        let mut arena = Arena::new();
        let enc = LocalEncountered::new();

        let Extended::Children(mut children) =
            Assembly::seed(&ctx).generate_extensions(&mut arena, &enc, None)
        else {
            panic!("seed should expand");
        };
        let compressed = children
            .last_mut()
            .expect("should have children")
            .compress();

        let mut bytes = compressed.as_bytes().to_vec();
        assert!(CompressedAssembly::from_bytes(bytes.clone()).is_ok());

        if let Some(byte) = bytes.get_mut(6) {
            *byte ^= 0xff;
        }
        assert!(matches!(
            CompressedAssembly::from_bytes(bytes),
            Err(crate::Error::ChecksumMismatch { .. }),
        ));
    }

    #[test]
    fn payload_summary_matches_without_decoding() {
        let shapes = vec![TreeShape::Node(vec![
            TreeShape::Leaf(1),
            TreeShape::Leaf(2),
        ])];
        let compressed = CompressedAssembly::from_parts(-1.5, -2.5, 3, &shapes);

        let restored =
            CompressedAssembly::from_bytes(compressed.as_bytes().to_vec()).expect("should parse");
        assert_eq!(-1.5, restored.score());
        assert_eq!(-2.5, restored.best_case());
        assert_eq!(3, restored.nodes_left());
        assert_eq!(shapes, restored.shapes().expect("should decode"));
    }

    #[test]
    fn rejects_out_of_range_rank() {
        let ctx = three_leaves();
        let mut arena = Arena::new();

        let shapes = vec![TreeShape::Node(vec![
            TreeShape::Leaf(1),
            TreeShape::Leaf(9),
        ])];
        let compressed = CompressedAssembly::from_parts(0.0, 0.0, 1, &shapes);

        assert!(Assembly::uncompress(&compressed, &ctx, &mut arena).is_err());
    }

    #[test]
    fn rejects_truncated_payload() {
        assert!(CompressedAssembly::from_bytes(vec![1, 2, 3]).is_err());
    }
}
