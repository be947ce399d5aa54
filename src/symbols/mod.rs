//! Debug-symbol sidecar access: documents, sequence points, branch points.
//!
//! The instrumentation engine consumes symbols through a deliberately small
//! contract: per instruction a *sequence point* (source line range), and per
//! method an ordered list of *branch points* (one per outgoing edge of every
//! conditional fork). This module realises that contract for the Portable
//! PDB sidecar format:
//!
//! - [`SymbolFile`] parses a standalone sidecar (`<module>.pdb`). A
//!   standalone sidecar is a metadata-only image: the usual `BSJB` root and
//!   stream directory, but without any PE envelope and with a version
//!   string the PE loader would reject, so the container walk lives here
//!   while the tables stream and heaps are handed to the metadata
//!   framework's own parsers.
//! - [`SequencePoint`] records are decoded from the compressed blob format
//!   of the `MethodDebugInformation` table (one row per method, 1:1 with
//!   MethodDef RIDs).
//! - [`BranchPoint`] records are computed from a method's decoded
//!   instruction stream joined with its sequence points; forks whose
//!   governing sequence point is hidden or missing are emitted with
//!   `start_line == -1` and no document, which downstream consumers skip
//!   (compiler-synthesised branches in generated equality members have no
//!   reliable source anchor).

mod branches;
mod container;
mod sequences;

pub use branches::branch_points;
pub use container::SymbolFile;
pub(crate) use sequences::decode_sequence_points;


/// A debug-info record mapping one IL offset to a source line range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePoint {
    /// IL offset of the instruction the point anchors to.
    pub il_offset: u32,
    /// First covered source line.
    pub start_line: u32,
    /// Last covered source line.
    pub end_line: u32,
    /// First covered column.
    pub start_column: u32,
    /// Last covered column.
    pub end_column: u32,
    /// Document table RID (1-based) of the source file.
    pub document: u32,
    /// True for points that carry no usable source location.
    pub is_hidden: bool,
}

/// One outgoing edge of a conditional fork, as produced by the symbol
/// analyser.
///
/// `end_offset` locates the first instruction of the edge's arm: the place
/// a counter prelude has to land so the edge is counted before its arm
/// runs. A branch point with no document or with `start_line == -1` must
/// be skipped by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPoint {
    /// Document table RID of the source file, when the fork has a usable
    /// source anchor.
    pub document: Option<u32>,
    /// IL offset of the fork instruction.
    pub offset: u32,
    /// IL offset of the first instruction of this edge's arm.
    pub end_offset: u32,
    /// Source line of the fork, or `-1` when unknown.
    pub start_line: i32,
    /// Edge number at the fork (0 = fall-through, then targets in order).
    pub path: u32,
    /// Ordinal among all branch points sharing this source line.
    pub ordinal: u32,
}

impl BranchPoint {
    /// True when this branch point carries no usable source anchor and
    /// must not be instrumented.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.start_line < 0 || self.document.is_none()
    }
}
