// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    assembly::{compress::TreeShape, CompressedAssembly},
    context::Context,
    coordinator::Topology,
    Error,
};
use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

const LEAF_ENCODING_ENTRY: &str = "leaf_name_encoding";
const UNFINISHED_ENTRY: &str = "unfinished_assemblies";
const ENCOUNTERED_ENTRY: &str = "encountered_assemblies";
const ACCEPTED_ENTRY: &str = "accepted_complete_assemblies";

/// Everything a restart needs, read back from a save archive
pub(crate) struct SaveState {
    pub unfinished: Vec<CompressedAssembly>,
    pub encountered: Vec<Box<str>>,
    pub accepted: Vec<Topology>,
}

/// Resolves the archive path a save file name maps to.
pub(crate) fn archive_path(save_file_name: &str) -> PathBuf {
    PathBuf::from(format!("{save_file_name}.tar.gz"))
}

/// Writes the save archive: leaf name encoding, unfinished assemblies,
/// encountered set and accepted topologies, gzipped-tarred together.
///
/// Files are staged in a temporary directory next to the archive; on
/// failure the staging directory is cleaned up with it.
pub(crate) fn write_archive(
    save_file_name: &str,
    ctx: &Context,
    unfinished: &[CompressedAssembly],
    encountered: &[Box<str>],
    accepted: &[Topology],
) -> crate::Result<PathBuf> {
    let archive = archive_path(save_file_name);
    let staging_root = archive
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let staging = tempfile::Builder::new()
        .prefix("tmp_savedir")
        .tempdir_in(staging_root)?;

    write_leaf_encoding(&staging.path().join(LEAF_ENCODING_ENTRY), ctx)?;
    write_unfinished(&staging.path().join(UNFINISHED_ENTRY), unfinished)?;
    write_lines(
        &staging.path().join(ENCOUNTERED_ENTRY),
        encountered.iter().map(AsRef::as_ref),
    )?;
    write_accepted(&staging.path().join(ACCEPTED_ENTRY), accepted)?;

    let file = std::fs::File::create(&archive)?;
    let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut tar = tar::Builder::new(gz);

    for entry in [
        LEAF_ENCODING_ENTRY,
        UNFINISHED_ENTRY,
        ENCOUNTERED_ENTRY,
        ACCEPTED_ENTRY,
    ] {
        tar.append_path_with_name(staging.path().join(entry), entry)?;
    }
    tar.into_inner()?.finish()?.sync_all()?;

    log::info!(
        "Wrote save archive {archive:?}: {} unfinished, {} accepted",
        unfinished.len(),
        accepted.len(),
    );
    Ok(archive)
}

fn write_leaf_encoding(path: &Path, ctx: &Context) -> crate::Result<()> {
    let mut out = std::fs::File::create(path)?;
    for leaf in ctx.leaves() {
        writeln!(out, "{}\t{}", leaf.rank(), ctx.name_of(leaf))?;
    }
    Ok(())
}

fn write_unfinished(path: &Path, unfinished: &[CompressedAssembly]) -> crate::Result<()> {
    let mut out = std::fs::File::create(path)?;

    for compressed in unfinished {
        let newicks = compressed
            .shapes()?
            .iter()
            .map(shape_to_rank_newick)
            .collect::<Vec<_>>()
            .join(" ");

        writeln!(
            out,
            "{:.5}\t{:.5}\t{}\t{newicks}",
            compressed.score(),
            compressed.best_case(),
            compressed.nodes_left(),
        )?;
    }
    Ok(())
}

fn write_lines<'a>(path: &Path, lines: impl Iterator<Item = &'a str>) -> crate::Result<()> {
    let mut out = std::fs::File::create(path)?;
    for line in lines {
        writeln!(out, "{line}")?;
    }
    Ok(())
}

fn write_accepted(path: &Path, accepted: &[Topology]) -> crate::Result<()> {
    let mut out = std::fs::File::create(path)?;
    for topology in accepted {
        writeln!(out, "{}\t{}", topology.score, topology.newick)?;
    }
    Ok(())
}

/// Reads a save archive back, validating the leaf name encoding against the
/// current input histograms.
pub(crate) fn read_archive(path: &Path, ctx: &Context) -> crate::Result<SaveState> {
    let file = std::fs::File::open(path)?;
    let gz = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(gz);

    let mut leaf_encoding: Option<String> = None;
    let mut unfinished: Option<String> = None;
    let mut encountered: Option<String> = None;
    let mut accepted: Option<String> = None;

    for entry in tar.entries()? {
        let mut entry = entry?;
        let name = entry
            .path()?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        let mut content = String::new();
        entry.read_to_string(&mut content)?;

        match name.as_deref() {
            Some(LEAF_ENCODING_ENTRY) => leaf_encoding = Some(content),
            Some(UNFINISHED_ENTRY) => unfinished = Some(content),
            Some(ENCOUNTERED_ENTRY) => encountered = Some(content),
            Some(ACCEPTED_ENTRY) => accepted = Some(content),
            _ => log::warn!("Ignoring unknown archive entry {name:?}"),
        }
    }

    let leaf_encoding = leaf_encoding.ok_or(Error::MissingArchiveEntry(LEAF_ENCODING_ENTRY))?;
    let unfinished = unfinished.ok_or(Error::MissingArchiveEntry(UNFINISHED_ENTRY))?;
    let encountered = encountered.ok_or(Error::MissingArchiveEntry(ENCOUNTERED_ENTRY))?;
    let accepted = accepted.ok_or(Error::MissingArchiveEntry(ACCEPTED_ENTRY))?;

    validate_leaf_encoding(&leaf_encoding, ctx)?;

    Ok(SaveState {
        unfinished: parse_unfinished(&unfinished)?,
        encountered: encountered
            .lines()
            .filter(|l| !l.is_empty())
            .map(Into::into)
            .collect(),
        accepted: parse_accepted(&accepted)?,
    })
}

/// The archive references leaves by rank; a restart is only valid against
/// inputs that produce the identical rank assignment.
fn validate_leaf_encoding(content: &str, ctx: &Context) -> crate::Result<()> {
    let mut seen = 0usize;

    for line in content.lines().filter(|l| !l.is_empty()) {
        let (rank, name) = line
            .split_once('\t')
            .ok_or(Error::MalformedArchiveEntry(LEAF_ENCODING_ENTRY))?;
        let rank: u32 = rank
            .parse()
            .map_err(|_| Error::MalformedArchiveEntry(LEAF_ENCODING_ENTRY))?;

        if ctx.rank_of(name).map(crate::histogram::LeafId::rank) != Some(rank) {
            return Err(Error::LeafEncodingMismatch);
        }
        seen += 1;
    }

    if seen == ctx.leaf_count() {
        Ok(())
    } else {
        Err(Error::LeafEncodingMismatch)
    }
}

fn parse_unfinished(content: &str) -> crate::Result<Vec<CompressedAssembly>> {
    let mut out = vec![];

    for line in content.lines().filter(|l| !l.is_empty()) {
        let mut fields = line.splitn(4, '\t');
        let (Some(score), Some(best_case), Some(nodes_left), Some(newicks)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(Error::MalformedArchiveEntry(UNFINISHED_ENTRY));
        };

        let score: f64 = score
            .parse()
            .map_err(|_| Error::MalformedArchiveEntry(UNFINISHED_ENTRY))?;
        let best_case: f64 = best_case
            .parse()
            .map_err(|_| Error::MalformedArchiveEntry(UNFINISHED_ENTRY))?;
        let nodes_left: u32 = nodes_left
            .parse()
            .map_err(|_| Error::MalformedArchiveEntry(UNFINISHED_ENTRY))?;

        let shapes = newicks
            .split(' ')
            .filter(|n| !n.is_empty())
            .map(parse_rank_newick)
            .collect::<crate::Result<Vec<_>>>()?;

        out.push(CompressedAssembly::from_parts(
            score, best_case, nodes_left, &shapes,
        ));
    }

    Ok(out)
}

fn parse_accepted(content: &str) -> crate::Result<Vec<Topology>> {
    let mut out = vec![];

    for line in content.lines().filter(|l| !l.is_empty()) {
        let (score, newick) = line
            .split_once('\t')
            .ok_or(Error::MalformedArchiveEntry(ACCEPTED_ENTRY))?;
        let score: f64 = score
            .parse()
            .map_err(|_| Error::MalformedArchiveEntry(ACCEPTED_ENTRY))?;

        out.push(Topology {
            score,
            newick: newick.to_owned(),
        });
    }

    Ok(out)
}

fn shape_to_rank_newick(shape: &TreeShape) -> String {
    let mut out = String::new();
    push_rank_newick(shape, &mut out);
    out
}

fn push_rank_newick(shape: &TreeShape, out: &mut String) {
    match shape {
        TreeShape::Leaf(rank) => out.push_str(&rank.to_string()),
        TreeShape::Node(children) => {
            out.push('(');
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_rank_newick(child, out);
            }
            out.push(')');
        }
    }
}

/// Parses the rank-Newick form used in archives: leaves are decimal ranks,
/// internal nodes parenthesized comma-separated child lists.
fn parse_rank_newick(input: &str) -> crate::Result<TreeShape> {
    let bytes = input.as_bytes();
    let (shape, consumed) = parse_shape(bytes, 0)?;

    if consumed == bytes.len() {
        Ok(shape)
    } else {
        Err(Error::MalformedArchiveEntry(UNFINISHED_ENTRY))
    }
}

fn parse_shape(bytes: &[u8], at: usize) -> crate::Result<(TreeShape, usize)> {
    match bytes.get(at) {
        Some(b'(') => {
            let mut children = vec![];
            let mut pos = at + 1;

            loop {
                let (child, next) = parse_shape(bytes, pos)?;
                children.push(child);
                pos = next;

                match bytes.get(pos) {
                    Some(b',') => pos += 1,
                    Some(b')') => {
                        pos += 1;
                        break;
                    }
                    _ => return Err(Error::MalformedArchiveEntry(UNFINISHED_ENTRY)),
                }
            }

            if children.len() < 2 {
                return Err(Error::MalformedArchiveEntry(UNFINISHED_ENTRY));
            }
            Ok((TreeShape::Node(children), pos))
        }
        Some(c) if c.is_ascii_digit() => {
            let mut pos = at;
            while bytes.get(pos).is_some_and(u8::is_ascii_digit) {
                pos += 1;
            }

            #[expect(clippy::indexing_slicing, reason = "digit range verified above")]
            let digits = std::str::from_utf8(&bytes[at..pos])
                .map_err(|_| Error::MalformedArchiveEntry(UNFINISHED_ENTRY))?;
            let rank: u32 = digits
                .parse()
                .map_err(|_| Error::MalformedArchiveEntry(UNFINISHED_ENTRY))?;

            Ok((TreeShape::Leaf(rank), pos))
        }
        _ => Err(Error::MalformedArchiveEntry(UNFINISHED_ENTRY)),
    }
}
