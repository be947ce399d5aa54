//! Instrumentation map: documents, lines, branches, and the hit-entry list.
//!
//! The map is the side data structure the engine hands back to the driver.
//! It correlates runtime counter slots with source locations: the 1-based
//! position of an entry in [`HitMap::entries`] is the entry's *hit index*,
//! and slot `index - 1` of the runtime counter array belongs to it. The
//! reporter joins this map with the binary hit file to produce coverage.
//!
//! Everything here is serde-serialisable so the driver can persist the map
//! between the instrumentation run and the report run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A source file referenced by debug information.
///
/// Documents are interned in first-seen order; `index` is dense, 0-based,
/// and stable for the lifetime of one instrumentation run. Hit entries
/// refer to documents by this index, never by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Source file path as recorded in the debug symbols.
    pub path: String,
    /// Dense 0-based index assigned in first-seen order.
    pub index: u32,
    /// Instrumented lines, keyed by line number. At most one entry per line.
    pub lines: BTreeMap<u32, Line>,
    /// Instrumented branches, keyed by `(line, ordinal)`.
    pub branches: BTreeMap<(u32, u32), Branch>,
}

/// One instrumented source line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    /// Line number in the document.
    pub number: u32,
    /// Fully-qualified name of the declaring type.
    pub class: String,
    /// Name of the method the line belongs to.
    pub method: String,
}

/// One outgoing edge of a conditional fork at a source line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Source line of the fork.
    pub line: u32,
    /// Fully-qualified name of the declaring type.
    pub class: String,
    /// Name of the method the branch belongs to.
    pub method: String,
    /// IL offset of the fork instruction.
    pub offset: u32,
    /// IL offset of the first instruction of this edge's arm.
    pub end_offset: u32,
    /// Edge number at the fork itself (0 = fall-through).
    pub path: u32,
    /// Ordinal among all branch points sharing this source line.
    pub ordinal: u32,
}

/// A single slot of the runtime counter array.
///
/// Entries are appended in emission order; the 1-based position of an
/// entry is its hit index. The counter array the injected tracker
/// allocates has exactly as many slots as there are entries, and slot
/// `index - 1` counts this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HitEntry {
    /// A sequence-point (line range) hit.
    Line {
        /// Index of the document the lines belong to.
        document: u32,
        /// First source line covered by the sequence point.
        start_line: u32,
        /// Last source line covered by the sequence point.
        end_line: u32,
    },
    /// A branch-edge hit.
    Branch {
        /// Index of the document the branch belongs to.
        document: u32,
        /// Source line of the fork.
        line: u32,
        /// Ordinal of the branch point at that line.
        ordinal: u32,
    },
}

/// Append-only accumulator for the instrumentation map.
///
/// The method instrumenter calls [`HitMap::add_line`] / [`HitMap::add_branch`]
/// as it splices preludes; each call interns the document, back-fills the
/// per-document line/branch records, appends a [`HitEntry`], and returns
/// the 0-based counter slot the spliced prelude must load.
#[derive(Debug, Default)]
pub struct HitMap {
    documents: Vec<Document>,
    entries: Vec<HitEntry>,
}

impl HitMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hit entries registered so far.
    ///
    /// At end-of-instrumentation this equals the length of the counter
    /// array allocated by the injected tracker's class initialiser.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no hits have been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered hit entries in emission order.
    #[must_use]
    pub fn entries(&self) -> &[HitEntry] {
        &self.entries
    }

    /// Interned documents in first-seen order.
    #[must_use]
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Registers a line hit and returns the 0-based counter slot for it.
    ///
    /// The document is interned if new; the line record is back-filled at
    /// most once per `(document, start_line)`.
    pub fn add_line(
        &mut self,
        document_path: &str,
        start_line: u32,
        end_line: u32,
        class: &str,
        method: &str,
    ) -> u32 {
        let doc_index = self.intern(document_path);
        let document = &mut self.documents[doc_index as usize];
        document.lines.entry(start_line).or_insert_with(|| Line {
            number: start_line,
            class: class.to_string(),
            method: method.to_string(),
        });

        self.entries.push(HitEntry::Line {
            document: doc_index,
            start_line,
            end_line,
        });
        (self.entries.len() - 1) as u32
    }

    /// Registers a branch hit and returns the 0-based counter slot for it.
    #[allow(clippy::too_many_arguments)]
    pub fn add_branch(
        &mut self,
        document_path: &str,
        line: u32,
        offset: u32,
        end_offset: u32,
        path: u32,
        ordinal: u32,
        class: &str,
        method: &str,
    ) -> u32 {
        let doc_index = self.intern(document_path);
        let document = &mut self.documents[doc_index as usize];
        document
            .branches
            .entry((line, ordinal))
            .or_insert_with(|| Branch {
                line,
                class: class.to_string(),
                method: method.to_string(),
                offset,
                end_offset,
                path,
                ordinal,
            });

        self.entries.push(HitEntry::Branch {
            document: doc_index,
            line,
            ordinal,
        });
        (self.entries.len() - 1) as u32
    }

    /// Consumes the map into `(documents, entries)`.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Document>, Vec<HitEntry>) {
        (self.documents, self.entries)
    }

    fn intern(&mut self, path: &str) -> u32 {
        if let Some(existing) = self.documents.iter().find(|d| d.path == path) {
            return existing.index;
        }

        let index = self.documents.len() as u32;
        self.documents.push(Document {
            path: path.to_string(),
            index,
            lines: BTreeMap::new(),
            branches: BTreeMap::new(),
        });
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_are_interned_in_first_seen_order() {
        let mut map = HitMap::new();
        map.add_line("b.cs", 1, 1, "B", "M");
        map.add_line("a.cs", 2, 2, "A", "M");
        map.add_line("b.cs", 3, 3, "B", "N");

        let docs = map.documents();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].path, "b.cs");
        assert_eq!(docs[0].index, 0);
        assert_eq!(docs[1].path, "a.cs");
        assert_eq!(docs[1].index, 1);
    }

    #[test]
    fn slots_are_zero_based_and_sequential() {
        let mut map = HitMap::new();
        assert_eq!(map.add_line("a.cs", 10, 10, "T", "M"), 0);
        assert_eq!(map.add_line("a.cs", 11, 11, "T", "M"), 1);
        assert_eq!(map.add_branch("a.cs", 20, 8, 10, 0, 0, "T", "M"), 2);
        assert_eq!(map.len(), 3);

        assert_eq!(
            map.entries()[2],
            HitEntry::Branch {
                document: 0,
                line: 20,
                ordinal: 0
            }
        );
    }

    #[test]
    fn line_records_are_unique_per_line() {
        let mut map = HitMap::new();
        map.add_line("a.cs", 10, 10, "T", "First");
        map.add_line("a.cs", 10, 12, "T", "Second");

        let doc = &map.documents()[0];
        assert_eq!(doc.lines.len(), 1);
        assert_eq!(doc.lines[&10].method, "First");
        // Both registrations still produced distinct hit entries.
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn branch_records_are_unique_per_line_and_ordinal() {
        let mut map = HitMap::new();
        map.add_branch("a.cs", 20, 8, 10, 0, 0, "T", "M");
        map.add_branch("a.cs", 20, 8, 14, 1, 1, "T", "M");
        map.add_branch("a.cs", 20, 8, 10, 0, 0, "T", "M");

        let doc = &map.documents()[0];
        assert_eq!(doc.branches.len(), 2);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn map_serialises_to_json_and_back() {
        let mut map = HitMap::new();
        map.add_line("a.cs", 10, 10, "T", "M");
        map.add_branch("a.cs", 20, 8, 10, 0, 0, "T", "M");
        let (documents, entries) = map.into_parts();

        let json = serde_json::to_string(&(&documents, &entries)).unwrap();
        let (docs2, entries2): (Vec<Document>, Vec<HitEntry>) =
            serde_json::from_str(&json).unwrap();
        assert_eq!(docs2.len(), documents.len());
        assert_eq!(entries2, entries);
    }
}
