//! Standalone Portable PDB container parsing.
//!
//! A sidecar symbol file is a bare metadata image: `BSJB` root, stream
//! directory, and the usual streams (`#~`, `#Strings`, `#US`, `#GUID`,
//! `#Blob`, plus the PDB-only `#Pdb`). There is no PE envelope, and the
//! root's version string is the `PDB v1.0` form, so the walk up to the
//! streams is done here; the tables stream and heaps are then handed to
//! the metadata framework's parsers.

use std::path::Path;

use dotscope::{
    metadata::tables::{DocumentRaw, MethodDebugInformationRaw},
    Blob, Parser, TablesHeader,
};

use crate::{
    error::bad_symbols,
    symbols::{decode_sequence_points, SequencePoint},
    Result,
};

/// Magic signature of a metadata root, `BSJB` in little-endian.
const METADATA_MAGIC: u32 = 0x424A_5342;

/// A parsed debug-symbol sidecar.
///
/// All data is extracted eagerly at load time into owned form: document
/// paths in RID order and per-method sequence points indexed by MethodDef
/// RID. The backing buffer is dropped before the constructor returns.
pub struct SymbolFile {
    /// Document paths, position `rid - 1` holds Document RID `rid`.
    documents: Vec<String>,
    /// Sequence points, position `rid - 1` holds MethodDef RID `rid`.
    methods: Vec<Vec<SequencePoint>>,
}

impl SymbolFile {
    /// Loads and parses a sidecar from a file.
    ///
    /// # Errors
    /// Returns [`crate::Error::Io`] if the file cannot be read and
    /// [`crate::Error::BadSymbols`] if the container is malformed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_mem(&std::fs::read(path)?)
    }

    /// Parses a sidecar from a memory buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::BadSymbols`] if the container is malformed.
    pub fn from_mem(data: &[u8]) -> Result<Self> {
        let streams = StreamDirectory::parse(data)?;

        let tables_data = streams
            .find("#~")
            .or_else(|| streams.find("#-"))
            .ok_or_else(|| bad_symbols!("sidecar has no metadata tables stream"))?;
        let blob_data = streams.find("#Blob").unwrap_or(&[]);

        let tables = TablesHeader::from(tables_data)?;
        let blobs = Blob::from(blob_data).ok();

        let mut documents = Vec::new();
        if let Some(document_table) = tables.table::<DocumentRaw>() {
            for row in document_table.iter() {
                let name = match &blobs {
                    Some(blobs) => decode_document_name(blobs, row.name)?,
                    None => String::new(),
                };
                documents.push(name);
            }
        }

        let mut methods = Vec::new();
        if let Some(debug_table) =
            tables.table::<MethodDebugInformationRaw>()
        {
            for row in debug_table.iter() {
                let points = match (&blobs, row.sequence_points) {
                    (Some(blobs), index) if index != 0 => {
                        let blob = blobs.get(index as usize)?;
                        decode_sequence_points(blob, row.document)?
                    }
                    _ => Vec::new(),
                };
                methods.push(points);
            }
        }

        Ok(SymbolFile { documents, methods })
    }

    /// Path of the document with the given Document table RID.
    #[must_use]
    pub fn document(&self, rid: u32) -> Option<&str> {
        if rid == 0 {
            return None;
        }
        self.documents.get(rid as usize - 1).map(String::as_str)
    }

    /// Sequence points of the method with the given MethodDef RID, in IL
    /// offset order. Empty for methods without debug information.
    #[must_use]
    pub fn sequence_points(&self, method_rid: u32) -> &[SequencePoint] {
        if method_rid == 0 {
            return &[];
        }
        self.methods
            .get(method_rid as usize - 1)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of documents in the sidecar.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        documents: Vec<String>,
        methods: Vec<Vec<SequencePoint>>,
    ) -> Self {
        SymbolFile { documents, methods }
    }
}

/// The stream directory of a metadata root: names and byte ranges.
struct StreamDirectory<'a> {
    data: &'a [u8],
    streams: Vec<(String, usize, usize)>,
}

impl<'a> StreamDirectory<'a> {
    fn parse(data: &'a [u8]) -> Result<StreamDirectory<'a>> {
        let mut parser = Parser::new(data);

        if parser.read_le::<u32>()? != METADATA_MAGIC {
            return Err(bad_symbols!("sidecar does not start with a metadata root"));
        }

        // major, minor, reserved
        parser.advance_by(8)?;
        let version_length = parser.read_le::<u32>()? as usize;
        parser.advance_by(version_length)?;

        // flags
        parser.advance_by(2)?;
        let stream_count = parser.read_le::<u16>()?;
        if stream_count == 0 || stream_count > 6 {
            return Err(bad_symbols!("invalid stream count: {}", stream_count));
        }

        let mut streams = Vec::with_capacity(stream_count as usize);
        for _ in 0..stream_count {
            let offset = parser.read_le::<u32>()? as usize;
            let size = parser.read_le::<u32>()? as usize;

            // Stream names are zero-terminated and padded to 4 bytes.
            let mut name = String::new();
            loop {
                let byte = parser.read_le::<u8>()?;
                if byte == 0 {
                    break;
                }
                name.push(char::from(byte));
                if name.len() > 32 {
                    return Err(bad_symbols!("unterminated stream name"));
                }
            }
            while parser.pos() % 4 != 0 {
                parser.advance()?;
            }

            if offset.checked_add(size).map_or(true, |end| end > data.len()) {
                return Err(bad_symbols!(
                    "stream '{}' extends past the end of the sidecar",
                    name
                ));
            }
            streams.push((name, offset, size));
        }

        Ok(StreamDirectory { data, streams })
    }

    fn find(&self, name: &str) -> Option<&'a [u8]> {
        self.streams
            .iter()
            .find(|(stream, _, _)| stream == name)
            .map(|&(_, offset, size)| &self.data[offset..offset + size])
    }
}

/// Decodes a Document name blob: a separator byte followed by compressed
/// blob-heap indexes of the path parts (index 0 is an empty part).
fn decode_document_name(blobs: &Blob<'_>, name_index: u32) -> Result<String> {
    if name_index == 0 {
        return Ok(String::new());
    }

    let blob = blobs.get(name_index as usize)?;
    if blob.is_empty() {
        return Ok(String::new());
    }

    let mut parser = Parser::new(blob);
    let separator = char::from(parser.read_le::<u8>()?);

    let mut parts = Vec::new();
    while parser.has_more_data() {
        let part_index = parser.read_compressed_uint()?;
        if part_index == 0 {
            parts.push(String::new());
        } else {
            let part = blobs.get(part_index as usize)?;
            parts.push(
                String::from_utf8(part.to_vec())
                    .map_err(|_| bad_symbols!("document name part is not UTF-8"))?,
            );
        }
    }

    if separator == '\0' {
        Ok(parts.concat())
    } else {
        Ok(parts.join(&separator.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::tests::{build_sidecar, BlobHeapBuilder};

    #[test]
    fn rejects_non_metadata_input() {
        assert!(SymbolFile::from_mem(&[0u8; 64]).is_err());
        assert!(SymbolFile::from_mem(b"MZ not a sidecar").is_err());
    }

    #[test]
    fn parses_documents_and_sequence_points() {
        let mut blobs = BlobHeapBuilder::new();
        let src = blobs.add(b"src");
        let file = blobs.add(b"widgets.cs");
        let name = blobs.add_document_name(b'/', &[src, file]);

        // One visible point at IL 0, line 10..10, then one at IL 5, line 11.
        let mut points = Vec::new();
        points.push(0x00); // local signature rid
        points.extend_from_slice(&[0x00, 0x01, 0x28, 0x0A, 0x01]); // IL+0, ΔL 1, ΔC 20, line 10, col 1
        points.extend_from_slice(&[0x05, 0x00, 0x04, 0x02, 0x00]); // IL+5, ΔL 0, ΔC 4, line +1, col +0
        let points = blobs.add(&points);

        let image = build_sidecar(&blobs.finish(), &[(name, 0, 0, 0)], &[(1, points)]);
        let symbols = SymbolFile::from_mem(&image).unwrap();

        assert_eq!(symbols.document_count(), 1);
        assert_eq!(symbols.document(1), Some("src/widgets.cs"));
        assert_eq!(symbols.document(0), None);
        assert_eq!(symbols.document(2), None);

        let points = symbols.sequence_points(1);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].il_offset, 0);
        assert_eq!(points[0].start_line, 10);
        assert_eq!(points[0].end_line, 11);
        assert!(!points[0].is_hidden);
        assert_eq!(points[1].il_offset, 5);
        assert_eq!(points[1].start_line, 11);
        assert_eq!(points[1].end_line, 11);
        assert_eq!(points[1].document, 1);

        assert!(symbols.sequence_points(2).is_empty());
        assert!(symbols.sequence_points(0).is_empty());
    }
}
