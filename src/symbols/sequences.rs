//! Sequence-point blob decoding.
//!
//! The `MethodDebugInformation` table stores one blob per method holding
//! delta-compressed sequence points. Layout:
//!
//! ```text
//! header:  local-signature RID        (compressed unsigned)
//!          initial document RID       (compressed unsigned, only when the
//!                                      row's Document column is 0)
//! records: ΔIL                        (compressed unsigned; the first
//!                                      record holds the absolute offset)
//!          -- ΔIL == 0 on a non-first record is a document-record,
//!             followed by the new document RID; no point is produced --
//!          ΔLines                     (compressed unsigned)
//!          ΔColumns                   (unsigned when ΔLines == 0,
//!                                      signed otherwise)
//!          -- ΔLines == 0 and ΔColumns == 0 is a hidden point; no
//!             line/column data follows --
//!          δStartLine                 (unsigned on the first non-hidden
//!                                      record, signed afterwards)
//!          δStartColumn               (same scheme)
//! ```

use dotscope::Parser;

use crate::{error::bad_symbols, symbols::SequencePoint, Result};

/// The line value compilers use to mark locations that must not be
/// stepped into; treated as hidden.
const HIDDEN_LINE: u32 = 0x00FE_EFEE;

/// Decodes one method's sequence-point blob.
///
/// `initial_document` is the value of the row's Document column; when it
/// is 0 the blob itself names the starting document.
///
/// # Errors
/// Returns [`crate::Error::BadSymbols`] when the blob is truncated or the
/// deltas produce out-of-range values.
pub(crate) fn decode_sequence_points(
    blob: &[u8],
    initial_document: u32,
) -> Result<Vec<SequencePoint>> {
    let mut parser = Parser::new(blob);

    // Local signature RID; not needed for coverage.
    let _ = parser.read_compressed_uint()?;

    let mut document = initial_document;
    if document == 0 {
        document = parser.read_compressed_uint()?;
    }

    let mut points = Vec::new();
    let mut il_offset = 0u32;
    let mut start_line = 0u32;
    let mut start_column = 0u32;
    let mut first_record = true;
    let mut first_location = true;

    while parser.has_more_data() {
        let delta_il = parser.read_compressed_uint()?;
        if delta_il == 0 && !first_record {
            // Document-record: switch documents, produce no point.
            document = parser.read_compressed_uint()?;
            continue;
        }

        il_offset = if first_record {
            delta_il
        } else {
            il_offset
                .checked_add(delta_il)
                .ok_or_else(|| bad_symbols!("sequence point IL offset overflow"))?
        };
        first_record = false;

        let delta_lines = parser.read_compressed_uint()?;
        let delta_columns = if delta_lines == 0 {
            i64::from(parser.read_compressed_uint()?)
        } else {
            i64::from(parser.read_compressed_int()?)
        };

        if delta_lines == 0 && delta_columns == 0 {
            points.push(SequencePoint {
                il_offset,
                start_line: HIDDEN_LINE,
                end_line: HIDDEN_LINE,
                start_column: 0,
                end_column: 0,
                document,
                is_hidden: true,
            });
            continue;
        }

        if first_location {
            start_line = parser.read_compressed_uint()?;
            start_column = parser.read_compressed_uint()?;
            first_location = false;
        } else {
            start_line = apply_delta(start_line, parser.read_compressed_int()?)
                .ok_or_else(|| bad_symbols!("sequence point line underflow"))?;
            start_column = apply_delta(start_column, parser.read_compressed_int()?)
                .ok_or_else(|| bad_symbols!("sequence point column underflow"))?;
        }

        let end_line = apply_delta(start_line, delta_lines as i32)
            .ok_or_else(|| bad_symbols!("sequence point end line overflow"))?;
        let end_column = apply_delta(start_column, delta_columns as i32)
            .ok_or_else(|| bad_symbols!("sequence point end column overflow"))?;

        let is_hidden = start_line == HIDDEN_LINE || start_line == 0;
        points.push(SequencePoint {
            il_offset,
            start_line,
            end_line,
            start_column,
            end_column,
            document,
            is_hidden,
        });
    }

    Ok(points)
}

fn apply_delta(base: u32, delta: i32) -> Option<u32> {
    if delta >= 0 {
        base.checked_add(delta as u32)
    } else {
        base.checked_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::tests::{cint, cuint};

    fn blob(parts: &[Vec<u8>]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn decodes_visible_points_with_signed_deltas() {
        // local sig 0; point at IL 0 line 10 col 5, ΔL 0 ΔC 10;
        // point at IL 7, line 8 (delta -2), col 5 (delta 0), ΔL 1 ΔC -3.
        let data = blob(&[
            cuint(0),
            cuint(0),
            cuint(0),
            cuint(10),
            cuint(10),
            cuint(5),
            cuint(7),
            cuint(1),
            cint(-3),
            cint(-2),
            cint(0),
        ]);

        let points = decode_sequence_points(&data, 3).unwrap();
        assert_eq!(points.len(), 2);

        assert_eq!(points[0].il_offset, 0);
        assert_eq!(points[0].start_line, 10);
        assert_eq!(points[0].end_line, 10);
        assert_eq!(points[0].start_column, 5);
        assert_eq!(points[0].end_column, 15);
        assert_eq!(points[0].document, 3);
        assert!(!points[0].is_hidden);

        assert_eq!(points[1].il_offset, 7);
        assert_eq!(points[1].start_line, 8);
        assert_eq!(points[1].end_line, 9);
        assert_eq!(points[1].start_column, 5);
        assert_eq!(points[1].end_column, 2);
    }

    #[test]
    fn decodes_hidden_points() {
        // Visible point at line 4, then a hidden point at IL 9.
        let data = blob(&[
            cuint(0),
            cuint(0),
            cuint(1),
            cuint(2),
            cuint(4),
            cuint(0),
            cuint(9),
            cuint(0),
            cuint(0),
        ]);

        let points = decode_sequence_points(&data, 1).unwrap();
        assert_eq!(points.len(), 2);
        assert!(!points[0].is_hidden);
        assert!(points[1].is_hidden);
        assert_eq!(points[1].il_offset, 9);
        assert_eq!(points[1].start_line, HIDDEN_LINE);
    }

    #[test]
    fn document_record_switches_documents() {
        // Point in document 1, document-record to 2, point in document 2.
        let data = blob(&[
            cuint(0),
            cuint(1),
            cuint(0),
            cuint(20),
            cuint(20),
            cuint(1),
            cuint(0), // ΔIL == 0 on a later record: document-record
            cuint(2),
            cuint(3),
            cuint(0),
            cuint(5),
            cint(1),
            cint(0),
        ]);

        let points = decode_sequence_points(&data, 1).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].document, 1);
        assert_eq!(points[0].start_line, 20);
        assert_eq!(points[1].document, 2);
        assert_eq!(points[1].il_offset, 4);
        assert_eq!(points[1].start_line, 21);
    }

    #[test]
    fn initial_document_comes_from_blob_when_row_has_none() {
        let data = blob(&[cuint(0), cuint(7), cuint(0), cuint(1), cuint(2), cuint(30), cuint(1)]);

        let points = decode_sequence_points(&data, 0).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].document, 7);
        assert_eq!(points[0].start_line, 30);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let data = blob(&[cuint(0), cuint(0), cuint(1)]);
        assert!(decode_sequence_points(&data, 1).is_err());
    }
}
