//! The instrumentation engine's entry point.
//!
//! [`Instrumenter`] drives one module through the full pipeline: load
//! module and sidecar, plan every eligible method against the symbols,
//! inject the tracker clone, splice counter preludes, emit the tracker's
//! class initialiser with the final hit count, and write the module back
//! over its own file. The returned [`InstrumenterResult`] is the
//! instrumentation map a reporter later joins with the hit file.
//!
//! Planning and mutation are two separate passes over the same bytes:
//! the read-only view plans splice points and call-stack effects, then
//! is consumed into the mutable assembly that all edits and the
//! write-back go through. A driver may run many `Instrumenter`s
//! concurrently, one per module; nothing is shared between them.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use dotscope::{
    assembly::decode_stream, metadata::method::MethodBody, CilAssembly, CilAssemblyView, Parser,
};
use serde::{Deserialize, Serialize};

use crate::{
    filter::Filter,
    instrument::{call_stack_effects, instrument_method, MethodPlan, PreludeTokens},
    map::{Document, HitEntry, HitMap},
    module::ModuleMap,
    symbols::{branch_points, SymbolFile},
    tracker::{ExternalRef, ImportCache, TrackerInjector},
    Error, Result,
};

/// Method implementation code-type mask; anything but IL is skipped.
const IMPL_CODE_TYPE_MASK: u32 = 0x0003;

/// Coverage instrumentation of one managed module.
pub struct Instrumenter {
    module_path: PathBuf,
    identifier: String,
    filter: Filter,
}

/// The instrumentation map: everything a reporter needs to join the
/// binary hit file back to source locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumenterResult {
    /// Module basename without extension.
    pub module: String,
    /// Absolute path of the now-instrumented module.
    pub module_path: String,
    /// Where the injected runtime will persist hit counts.
    pub hits_file_path: String,
    /// Documents keyed by source path.
    pub documents: BTreeMap<String, Document>,
    /// Hit entries; the 1-based position of an entry is the hit index
    /// and `index - 1` is its slot in the runtime counter array.
    pub hit_entries: Vec<HitEntry>,
}

impl Instrumenter {
    /// Creates an instrumenter for `module_path`.
    ///
    /// `identifier` is an opaque token making tracker type names and hit
    /// file paths unique across concurrent instrumentation runs of the
    /// same module.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFilter`] when a filter pattern does not
    /// compile.
    pub fn new(
        module_path: impl Into<PathBuf>,
        identifier: impl Into<String>,
        exclude_filters: &[String],
        include_filters: &[String],
        excluded_files: &[String],
    ) -> Result<Self> {
        Ok(Instrumenter {
            module_path: module_path.into(),
            identifier: identifier.into(),
            filter: Filter::new(exclude_filters, include_filters, excluded_files)?,
        })
    }

    /// True when the module has a debug-symbol sidecar next to it.
    ///
    /// Instrumentation is line-based and cannot work without symbols;
    /// callers must gate [`Instrumenter::instrument`] on this.
    #[must_use]
    pub fn can_instrument(&self) -> bool {
        self.module_path.is_file() && self.sidecar_path().is_file()
    }

    /// Instruments the module in place and returns the map.
    ///
    /// # Errors
    /// [`Error::PreconditionFailed`] without a sidecar; sidecar parse
    /// failures as [`Error::BadSymbols`]; metadata and I/O failures are
    /// propagated — the on-disk module may then be in an indeterminate
    /// state, so drivers are expected to operate on copies.
    pub fn instrument(&mut self) -> Result<InstrumenterResult> {
        if !self.can_instrument() {
            return Err(Error::PreconditionFailed(format!(
                "no debug symbols next to {}",
                self.module_path.display()
            )));
        }

        let module_basename = self
            .module_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let hits_file_path =
            std::env::temp_dir().join(format!("{module_basename}_{}", self.identifier));
        let hits_file_str = hits_file_path.to_string_lossy().into_owned();

        let symbols = SymbolFile::from_path(self.sidecar_path())?;
        let view = CilAssemblyView::from_path(&self.module_path)?;
        let plans = self.plan_methods(&view, &symbols)?;
        log::debug!(
            "{}: {} methods planned for instrumentation",
            module_basename,
            plans.len()
        );

        let mut assembly = CilAssembly::new(view);
        let mut imports = ImportCache::new(&mut assembly)?;
        let injector = TrackerInjector::inject(
            &mut assembly,
            &mut imports,
            &module_basename,
            &self.identifier,
            &hits_file_str,
        )?;
        log::debug!("injected tracker type {}", injector.type_name());
        let tokens = PreludeTokens {
            hits_array: injector.hits_array()?,
            int32_type: imports.resolve(&mut assembly, ExternalRef::Int32Type)?,
            increment: imports.resolve(&mut assembly, ExternalRef::InterlockedIncrement)?,
        };

        let mut map = HitMap::new();
        for plan in &plans {
            instrument_method(&mut assembly, plan, &symbols, &self.filter, tokens, &mut map)?;
        }

        injector.finish(&mut assembly, &mut imports, map.len())?;
        assembly.to_file(&self.module_path)?;

        let module_path = self
            .module_path
            .canonicalize()
            .unwrap_or_else(|_| self.module_path.clone());
        let (documents, hit_entries) = map.into_parts();

        Ok(InstrumenterResult {
            module: module_basename,
            module_path: module_path.to_string_lossy().into_owned(),
            hits_file_path: hits_file_str,
            documents: documents
                .into_iter()
                .map(|document| (document.path.clone(), document))
                .collect(),
            hit_entries,
        })
    }

    /// Collects the rebuild plan of every eligible method.
    fn plan_methods(
        &self,
        view: &CilAssemblyView,
        symbols: &SymbolFile,
    ) -> Result<Vec<MethodPlan>> {
        let module = ModuleMap::build(view)?;
        let file = view.file();
        let mut plans = Vec::new();

        for type_info in module.types() {
            if !self.filter.is_type_instrumented(&module, type_info.rid) {
                continue;
            }

            for method_rid in type_info.method_list..type_info.method_end {
                let Some(method) = module.method_by_rid(method_rid) else {
                    continue;
                };
                if method.rva == 0 || method.impl_flags & IMPL_CODE_TYPE_MASK != 0 {
                    continue;
                }
                if !self.filter.is_method_instrumented(&module, method_rid) {
                    continue;
                }

                let sequence_points = symbols.sequence_points(method_rid).to_vec();
                if sequence_points.is_empty() {
                    continue;
                }

                let Ok(body_offset) = file.rva_to_offset(method.rva as usize) else {
                    log::debug!("{}::{}: body rva unmapped", type_info.name, method.name);
                    continue;
                };
                let data = file.data();
                let Ok(body) = MethodBody::from(&data[body_offset..]) else {
                    // Unparseable bodies are treated like native ones.
                    log::debug!("{}::{}: unreadable body", type_info.name, method.name);
                    continue;
                };

                let code_start = body_offset + body.size_header;
                let Ok(code) = file.data_slice(code_start, body.size_code) else {
                    continue;
                };
                let mut parser = Parser::new(code);
                let Ok(instructions) = decode_stream(&mut parser, 0) else {
                    log::debug!("{}::{}: undecodable stream", type_info.name, method.name);
                    continue;
                };

                let branch_points = branch_points(&instructions, &sequence_points);
                let call_effects = call_stack_effects(view, &instructions);

                plans.push(MethodPlan {
                    rid: method_rid,
                    class: module.full_name(type_info.rid),
                    method: method.name.clone(),
                    handlers: body.exception_handlers,
                    local_var_sig_token: body.local_var_sig_token,
                    init_locals: body.is_init_local,
                    max_stack: body.max_stack,
                    instructions,
                    sequence_points,
                    branch_points,
                    call_effects,
                });
            }
        }

        Ok(plans)
    }

    fn sidecar_path(&self) -> PathBuf {
        self.module_path.with_extension("pdb")
    }
}

/// Convenience wrapper for drivers: the hit file path an instrumenter
/// with this module/identifier pair will use.
#[must_use]
pub fn hits_file_path_for(module_path: &Path, identifier: &str) -> PathBuf {
    let basename = module_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("{basename}_{identifier}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sidecar_blocks_instrumentation() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("App.dll");
        std::fs::write(&module, b"MZ").unwrap();

        let mut instrumenter = Instrumenter::new(&module, "t0", &[], &[], &[]).unwrap();
        assert!(!instrumenter.can_instrument());
        assert!(matches!(
            instrumenter.instrument(),
            Err(Error::PreconditionFailed(_))
        ));
    }

    #[test]
    fn distinct_identifiers_produce_distinct_hit_files() {
        let module = Path::new("/work/Widgets.dll");
        let first = hits_file_path_for(module, "aaa");
        let second = hits_file_path_for(module, "bbb");
        assert_ne!(first, second);
        assert!(first.to_string_lossy().ends_with("Widgets_aaa"));
    }

    #[test]
    fn bad_filter_pattern_is_rejected() {
        let result = Instrumenter::new("App.dll", "t0", &["[".to_string()], &[], &[]);
        assert!(matches!(result, Err(Error::InvalidFilter { .. })));
    }

    #[test]
    fn result_round_trips_through_json() {
        let result = InstrumenterResult {
            module: "Widgets".to_string(),
            module_path: "/work/Widgets.dll".to_string(),
            hits_file_path: "/tmp/Widgets_t0".to_string(),
            documents: BTreeMap::new(),
            hit_entries: vec![HitEntry::Line {
                document: 0,
                start_line: 10,
                end_line: 10,
            }],
        };

        let json = serde_json::to_string(&result).unwrap();
        let back: InstrumenterResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.module, "Widgets");
        assert_eq!(back.hit_entries, result.hit_entries);
    }
}
