//! Method instrumentation: prelude splicing with reference-stable
//! re-encoding.
//!
//! Splicing into an instruction stream moves every offset after the
//! splice point, so the body is rebuilt in one pass around labels
//! instead of patching offsets: every original instruction offset
//! becomes a label, branch and switch operands are rewritten to target
//! labels, and exception-handler boundaries are mapped through the same
//! label table. A counter prelude is emitted *after* its anchor's label
//! is defined and *before* the anchor instruction itself, which lands
//! the label on the prelude head — every control transfer that entered
//! the anchor now enters the prelude, and the anchor remains the
//! prelude's fall-through. Branches are emitted in long form and the
//! encoder's finalisation shrinks them back where the offset fits, so a
//! splice can never invalidate a short-form encoding.
//!
//! The splice points of a method are precomputed before any emission;
//! a method whose body cannot be rebuilt is skipped in its original
//! form and registers no hits.

use std::collections::{BTreeMap, HashMap};

use dotscope::{
    assembly::{FlowType, Instruction, InstructionEncoder, Operand},
    metadata::{
        method::{
            encode_exception_handlers, encode_method_body_header, ExceptionHandler,
            ExceptionHandlerFlags,
        },
        signatures::{SignatureParser, TypeSignature},
        tables::{
            MemberRefRaw, MethodDefRaw, MethodSpecRaw, StandAloneSigRaw, TableDataOwned, TableId,
        },
        token::Token,
    },
    CilAssembly, CilAssemblyView,
};

use crate::{
    filter::Filter,
    map::HitMap,
    symbols::{BranchPoint, SequencePoint, SymbolFile},
    Result,
};

/// Everything needed to rebuild one method, captured during planning.
pub(crate) struct MethodPlan {
    /// MethodDef RID.
    pub rid: u32,
    /// Namespace-qualified declaring type name.
    pub class: String,
    /// Method name.
    pub method: String,
    /// Decoded instruction stream, offsets relative to the code start.
    pub instructions: Vec<Instruction>,
    /// Exception handlers as parsed from the original body.
    pub handlers: Vec<ExceptionHandler>,
    /// Original locals signature token (0 = none).
    pub local_var_sig_token: u32,
    /// Original init-locals flag.
    pub init_locals: bool,
    /// Original declared operand stack bound.
    pub max_stack: usize,
    /// Sequence points of the method, in IL offset order.
    pub sequence_points: Vec<SequencePoint>,
    /// Branch points of the method, fall-through edges first.
    pub branch_points: Vec<BranchPoint>,
    /// Stack effects of call-shaped instructions, keyed by token value.
    pub call_effects: HashMap<u32, (u8, bool)>,
}

/// Metadata tokens the spliced preludes reference.
#[derive(Clone, Copy)]
pub(crate) struct PreludeTokens {
    /// The clone type's `HitsArray` static field.
    pub hits_array: Token,
    /// `System.Int32`, the `ldelema` element type.
    pub int32_type: Token,
    /// The imported atomic 32-bit increment.
    pub increment: Token,
}

/// One registration the rebuilt body commits to the hit map.
enum PendingHit {
    Line {
        document: String,
        start_line: u32,
        end_line: u32,
    },
    Branch {
        document: String,
        line: u32,
        offset: u32,
        end_offset: u32,
        path: u32,
        ordinal: u32,
    },
}

/// Hits anchored at one instruction: at most one line, any number of
/// branch edges, line first. Document paths are resolved at collection
/// time so emission never consults the sidecar again.
#[derive(Default)]
struct Anchor {
    line: Option<(SequencePoint, String)>,
    branches: Vec<(BranchPoint, String)>,
}

/// Rewrites one method according to its plan.
///
/// Returns the number of preludes spliced; zero means the method was
/// left untouched (no anchors, or the body could not be rebuilt).
pub(crate) fn instrument_method(
    assembly: &mut CilAssembly,
    plan: &MethodPlan,
    symbols: &SymbolFile,
    filter: &Filter,
    tokens: PreludeTokens,
    map: &mut HitMap,
) -> Result<usize> {
    let anchors = collect_anchors(plan, symbols, filter);
    if anchors.is_empty() {
        return Ok(0);
    }

    let base_slot = map.len() as u32;
    let rebuilt = match rebuild_body(plan, &anchors, tokens, base_slot) {
        Ok(rebuilt) => rebuilt,
        Err(e) => {
            // Treated like an unreadable body: the method keeps its
            // original code and contributes nothing to the map.
            log::warn!(
                "skipping {}::{}: body could not be rebuilt: {e}",
                plan.class,
                plan.method
            );
            return Ok(0);
        }
    };

    for hit in &rebuilt.hits {
        match hit {
            PendingHit::Line {
                document,
                start_line,
                end_line,
            } => {
                map.add_line(document, *start_line, *end_line, &plan.class, &plan.method);
            }
            PendingHit::Branch {
                document,
                line,
                offset,
                end_offset,
                path,
                ordinal,
            } => {
                map.add_branch(
                    document,
                    *line,
                    *offset,
                    *end_offset,
                    *path,
                    *ordinal,
                    &plan.class,
                    &plan.method,
                );
            }
        }
    }

    let placeholder_rva = assembly.store_method_body(rebuilt.body);
    update_method_rva(assembly, plan.rid, placeholder_rva)?;
    Ok(rebuilt.hits.len())
}

/// Joins sequence points and branch points into per-offset anchors,
/// dropping hidden points, excluded documents, and skipped branches.
fn collect_anchors(
    plan: &MethodPlan,
    symbols: &SymbolFile,
    filter: &Filter,
) -> BTreeMap<u32, Anchor> {
    let mut anchors: BTreeMap<u32, Anchor> = BTreeMap::new();

    let offsets: std::collections::HashSet<u32> = plan
        .instructions
        .iter()
        .map(|i| i.offset as u32)
        .collect();

    for point in &plan.sequence_points {
        if point.is_hidden || !offsets.contains(&point.il_offset) {
            continue;
        }
        let Some(document) = symbols.document(point.document) else {
            continue;
        };
        if filter.is_file_excluded(document) {
            log::debug!("sequence point in excluded file {document}");
            continue;
        }
        anchors.entry(point.il_offset).or_default().line =
            Some((point.clone(), document.to_string()));
    }

    for branch in &plan.branch_points {
        if branch.is_skipped() || !offsets.contains(&branch.end_offset) {
            continue;
        }
        let Some(document) = branch.document.and_then(|rid| symbols.document(rid)) else {
            continue;
        };
        if filter.is_file_excluded(document) {
            continue;
        }
        anchors
            .entry(branch.end_offset)
            .or_default()
            .branches
            .push((branch.clone(), document.to_string()));
    }

    anchors
}

struct RebuiltBody {
    body: Vec<u8>,
    hits: Vec<PendingHit>,
}

fn rebuild_body(
    plan: &MethodPlan,
    anchors: &BTreeMap<u32, Anchor>,
    tokens: PreludeTokens,
    base_slot: u32,
) -> crate::Result<RebuiltBody> {
    let mut encoder = InstructionEncoder::new();
    let mut hits: Vec<PendingHit> = Vec::new();

    // Stack depth at handler entry is dictated by the clause kind, not
    // by fall-through tracking.
    let mut entry_depths: HashMap<u32, i16> = HashMap::new();
    for handler in &plan.handlers {
        let depth = if handler.flags.contains(ExceptionHandlerFlags::FINALLY)
            || handler.flags.contains(ExceptionHandlerFlags::FAULT)
        {
            0
        } else {
            1 // catch and filter handlers receive the exception object
        };
        entry_depths.insert(handler.handler_offset, depth);
        if handler.flags.contains(ExceptionHandlerFlags::FILTER) {
            entry_depths.insert(handler.filter_offset, 1);
        }
    }

    for instruction in &plan.instructions {
        let offset = instruction.offset as u32;
        encoder.define_label(&offset_label(offset))?;
        if let Some(&depth) = entry_depths.get(&offset) {
            encoder.set_stack_depth(depth);
        }

        if let Some(anchor) = anchors.get(&offset) {
            if let Some((point, document)) = &anchor.line {
                let slot = base_slot + hits.len() as u32;
                emit_prelude(&mut encoder, tokens, slot)?;
                hits.push(PendingHit::Line {
                    document: document.clone(),
                    start_line: point.start_line,
                    end_line: point.end_line,
                });
            }
            for (branch, document) in &anchor.branches {
                let slot = base_slot + hits.len() as u32;
                emit_prelude(&mut encoder, tokens, slot)?;
                hits.push(PendingHit::Branch {
                    document: document.clone(),
                    line: branch.start_line as u32,
                    offset: branch.offset,
                    end_offset: branch.end_offset,
                    path: branch.path,
                    ordinal: branch.ordinal,
                });
            }
        }

        emit_original(&mut encoder, instruction, plan)?;
    }

    // Handler ranges may end one past the last instruction.
    let code_end = plan
        .instructions
        .last()
        .map(|i| (i.offset + i.size) as u32)
        .unwrap_or(0);
    encoder.define_label(&offset_label(code_end))?;

    let (bytecode, tracked_max_stack, labels) = encoder.finalize()?;

    let map_offset = |offset: u32| -> crate::Result<u32> {
        labels.get(&offset_label(offset)).copied().ok_or_else(|| {
            crate::error::bad_symbols!("handler boundary {:#x} is not an instruction", offset)
        })
    };

    let mut handlers = Vec::with_capacity(plan.handlers.len());
    for handler in &plan.handlers {
        let try_offset = map_offset(handler.try_offset)?;
        let try_end = map_offset(handler.try_offset + handler.try_length)?;
        let handler_offset = map_offset(handler.handler_offset)?;
        let handler_end = map_offset(handler.handler_offset + handler.handler_length)?;
        // For filter clauses the field is a code offset; for typed
        // clauses it carries the exception class token and must pass
        // through untouched.
        let filter_offset = if handler.flags.contains(ExceptionHandlerFlags::FILTER) {
            map_offset(handler.filter_offset)?
        } else {
            handler.filter_offset
        };

        handlers.push(ExceptionHandler {
            flags: handler.flags,
            try_offset,
            try_length: try_end.saturating_sub(try_offset),
            handler_offset,
            handler_length: handler_end.saturating_sub(handler_offset),
            handler: None,
            filter_offset,
        });
    }

    let has_exceptions = !handlers.is_empty();
    let exception_data = if has_exceptions {
        encode_exception_handlers(&handlers)?
    } else {
        Vec::new()
    };

    // The prelude needs two free slots on top of whatever the original
    // code used.
    let max_stack = (plan.max_stack as u16 + 2).max(tracked_max_stack);

    let mut body = encode_method_body_header(
        bytecode.len() as u32,
        max_stack,
        plan.local_var_sig_token,
        has_exceptions,
        plan.init_locals,
    )?;
    body.extend_from_slice(&bytecode);
    if has_exceptions {
        while body.len() % 4 != 0 {
            body.push(0);
        }
        body.extend_from_slice(&exception_data);
    }

    Ok(RebuiltBody { body, hits })
}

/// Emits the five-instruction counter prelude for one hit slot:
///
/// ```text
/// ldsfld   HitsArray
/// ldc.i4   <slot>
/// ldelema  System.Int32
/// call     Interlocked::Increment(int32&)
/// pop
/// ```
fn emit_prelude(
    encoder: &mut InstructionEncoder,
    tokens: PreludeTokens,
    slot: u32,
) -> Result<()> {
    encoder.emit_instruction("ldsfld", Some(Operand::Token(tokens.hits_array)))?;
    encoder.emit_ldc_i4(slot as i32)?;
    encoder.emit_instruction("ldelema", Some(Operand::Token(tokens.int32_type)))?;
    encoder.emit_call("call", Some(Operand::Token(tokens.increment)), 1, true)?;
    encoder.emit_instruction("pop", None)?;
    Ok(())
}

/// Re-emits one original instruction, rewriting control transfers to
/// labels and feeding real stack effects for call-shaped instructions.
fn emit_original(
    encoder: &mut InstructionEncoder,
    instruction: &Instruction,
    plan: &MethodPlan,
) -> Result<()> {
    match instruction.flow_type {
        FlowType::ConditionalBranch | FlowType::UnconditionalBranch => {
            let target = instruction
                .branch_targets
                .first()
                .copied()
                .unwrap_or_else(|| fall_through(instruction)) as u32;
            encoder.emit_branch(long_form(instruction.mnemonic), &offset_label(target))?;
        }
        FlowType::Leave => {
            let target = leave_target(instruction);
            encoder.emit_branch(long_form(instruction.mnemonic), &offset_label(target))?;
        }
        FlowType::Switch => {
            let labels: Vec<String> = instruction
                .branch_targets
                .iter()
                .map(|&t| offset_label(t as u32))
                .collect();
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            encoder.emit_switch(&refs)?;
        }
        FlowType::Call => {
            let operand = match instruction.operand {
                Operand::None => None,
                ref other => Some(other.clone()),
            };
            let (pops, pushes) = call_effect(instruction, plan);
            encoder.emit_call(instruction.mnemonic, operand, pops, pushes)?;
        }
        FlowType::Return => {
            // The table's stack model for `ret` cannot know the return
            // arity; lift the tracked depth so a value-returning exit
            // never underflows.
            if encoder.current_stack_depth() < 1 {
                encoder.set_stack_depth(1);
            }
            encoder.emit_instruction_decoded(instruction)?;
        }
        _ => encoder.emit_instruction_decoded(instruction)?,
    }
    Ok(())
}

fn call_effect(instruction: &Instruction, plan: &MethodPlan) -> (u8, bool) {
    if let Operand::Token(token) = instruction.operand {
        if let Some(&effect) = plan.call_effects.get(&token.value()) {
            return effect;
        }
    }
    (0, false)
}

fn fall_through(instruction: &Instruction) -> u64 {
    instruction.offset + instruction.size
}

fn leave_target(instruction: &Instruction) -> u32 {
    if let Some(&target) = instruction.branch_targets.first() {
        return target as u32;
    }
    let relative: i64 = match instruction.operand {
        Operand::Immediate(dotscope::assembly::Immediate::Int8(v)) => i64::from(v),
        Operand::Immediate(dotscope::assembly::Immediate::Int32(v)) => i64::from(v),
        _ => 0,
    };
    (fall_through(instruction) as i64 + relative) as u32
}

/// Long-form spelling of a branch mnemonic; splicing may widen the
/// required offset, so everything is emitted long and re-optimised by
/// the encoder.
fn long_form(mnemonic: &str) -> &str {
    mnemonic.strip_suffix(".s").unwrap_or(mnemonic)
}

fn offset_label(offset: u32) -> String {
    format!("IL_{offset:04x}")
}

/// Updates a MethodDef row to point at a stored replacement body.
fn update_method_rva(
    assembly: &mut CilAssembly,
    rid: u32,
    placeholder_rva: u32,
) -> Result<()> {
    let existing = assembly
        .view()
        .tables()
        .and_then(|t| t.table::<MethodDefRaw>())
        .and_then(|table| table.get(rid))
        .ok_or_else(|| crate::error::bad_symbols!("MethodDef row {} not found", rid))?;

    let updated = MethodDefRaw {
        rid: existing.rid,
        token: existing.token,
        offset: existing.offset,
        rva: placeholder_rva,
        impl_flags: existing.impl_flags,
        flags: existing.flags,
        name: existing.name,
        signature: existing.signature,
        param_list: existing.param_list,
    };

    assembly.table_row_update(TableId::MethodDef, rid, TableDataOwned::MethodDef(updated))?;
    Ok(())
}

/// Computes the evaluation-stack effect of every call-shaped
/// instruction in a stream by parsing the target signatures.
pub(crate) fn call_stack_effects(
    view: &CilAssemblyView,
    instructions: &[Instruction],
) -> HashMap<u32, (u8, bool)> {
    let mut effects = HashMap::new();

    for instruction in instructions {
        let is_call = matches!(instruction.flow_type, FlowType::Call)
            || instruction.mnemonic == "newobj";
        if !is_call {
            continue;
        }
        let Operand::Token(token) = instruction.operand else {
            continue;
        };
        if effects.contains_key(&token.value()) {
            continue;
        }
        if let Some(effect) = resolve_call_effect(view, token, instruction.mnemonic == "newobj") {
            effects.insert(token.value(), effect);
        }
    }

    effects
}

fn resolve_call_effect(
    view: &CilAssemblyView,
    token: Token,
    is_newobj: bool,
) -> Option<(u8, bool)> {
    let signature_blob = signature_blob_of(view, token)?;
    let signature = SignatureParser::new(&signature_blob)
        .parse_method_signature()
        .ok()?;

    let mut pops = signature.params.len();
    if signature.has_this && !is_newobj {
        pops += 1;
    }
    let pushes = is_newobj || signature.return_type.base != TypeSignature::Void;
    Some((pops.min(u8::MAX as usize) as u8, pushes))
}

fn signature_blob_of(view: &CilAssemblyView, token: Token) -> Option<Vec<u8>> {
    let tables = view.tables()?;
    let blobs = view.blobs()?;

    let blob_index = match token.table() {
        0x06 => {
            tables
                .table::<MethodDefRaw>()?
                .get(token.row())?
                .signature
        }
        0x0A => {
            tables
                .table::<MemberRefRaw>()?
                .get(token.row())?
                .signature
        }
        0x2B => {
            // Generic instantiation: arity comes from the underlying
            // method reference.
            let spec = tables
                .table::<MethodSpecRaw>()?
                .get(token.row())?;
            let inner = crate::module::token_value(spec.method.tag, spec.method.row);
            return signature_blob_of(view, Token::new(inner));
        }
        0x11 => {
            tables
                .table::<StandAloneSigRaw>()?
                .get(token.row())?
                .signature
        }
        _ => return None,
    };

    blobs.get(blob_index as usize).ok().map(<[u8]>::to_vec)
}
