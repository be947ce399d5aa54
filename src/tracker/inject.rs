//! Tracker injection: cloning the template into a target module.
//!
//! The clone lives under [`crate::tracker::TRACKER_NAMESPACE`] with a
//! module-unique name `<module_basename>_<identifier>`. Cloning walks the
//! template data and resolves every role-keyed operand:
//!
//! - external references are imported once each through [`ImportCache`]
//!   (assembly reference, type reference, member reference),
//! - intra-template method references are redirected to the clone's own
//!   MethodDef rows (precomputed from the emission order),
//! - field references are remapped by name to the clone's fields,
//! - injector-supplied strings land in the user-string heap.
//!
//! The class initialiser is deferred: once every method has been
//! instrumented and the hit count is final, [`TrackerInjector::finish`]
//! emits it with the counter-array/path initialisation sequence spliced
//! in front of its terminator.

use std::collections::HashMap;

use dotscope::{
    assembly::{InstructionEncoder, Operand},
    metadata::{
        method::encode_method_body_header,
        signatures::{
            encode_field_signature, encode_local_var_signature, encode_method_signature,
            CustomModifiers, SignatureField, SignatureLocalVariable, SignatureLocalVariables,
            SignatureMethod, SignatureParameter, SignatureSzArray, TypeSignature,
        },
        tables::{
            AssemblyRefBuilder, AssemblyRefRaw, CodedIndex, CodedIndexType, CustomAttributeBuilder,
            FieldRaw, MemberRefBuilder, MethodDefBuilder, StandAloneSigBuilder, TableDataOwned,
            TableId, TypeDefBuilder, TypeRefBuilder, TypeSpecBuilder,
        },
        token::Token,
    },
    CilAssembly,
};

use crate::{
    tracker::template::{
        ExternalRef, Inst, TemplateField, TemplateLocal, TemplateMethod, TemplateStr, CCTOR,
    },
    tracker::TRACKER_NAMESPACE,
    Error, Result,
};

/// Core library names accepted as the import scope, in preference order.
const CORLIB_CANDIDATES: [&str; 4] = [
    "mscorlib",
    "System.Runtime",
    "netstandard",
    "System.Private.CoreLib",
];

/// Public key token of `System.Runtime`, used when the target module
/// references no recognised core library at all.
const SYSTEM_RUNTIME_KEY: [u8; 8] = [0xb0, 0x3f, 0x5f, 0x7f, 0x11, 0xd5, 0x0a, 0x3a];

/// Import cache: every external the template needs is created at most
/// once per module and resolved from here afterwards.
pub(crate) struct ImportCache {
    corlib_rid: u32,
    typerefs: HashMap<(&'static str, &'static str), u32>,
    resolved: HashMap<ExternalRef, Token>,
}

impl ImportCache {
    /// Finds the module's core-library assembly reference, creating one
    /// when the module references none.
    pub(crate) fn new(assembly: &mut CilAssembly) -> Result<Self> {
        let mut corlib_rid = 0u32;
        {
            let view = assembly.view();
            if let (Some(tables), Some(strings)) = (view.tables(), view.strings()) {
                if let Some(refs) = tables.table::<AssemblyRefRaw>() {
                    let mut best = usize::MAX;
                    for row in refs.iter() {
                        let Ok(name) = strings.get(row.name as usize) else {
                            continue;
                        };
                        if let Some(rank) = CORLIB_CANDIDATES.iter().position(|c| *c == name) {
                            if rank < best {
                                best = rank;
                                corlib_rid = row.rid;
                            }
                        }
                    }
                }
            }
        }

        if corlib_rid == 0 {
            let created = AssemblyRefBuilder::new()
                .name("System.Runtime")
                .version(8, 0, 0, 0)
                .public_key_token(&SYSTEM_RUNTIME_KEY)
                .build(assembly)?;
            corlib_rid = created.placeholder();
        }

        Ok(ImportCache {
            corlib_rid,
            typerefs: HashMap::new(),
            resolved: HashMap::new(),
        })
    }

    /// Resolves an external reference to its metadata token, importing
    /// it on first use.
    pub(crate) fn resolve(
        &mut self,
        assembly: &mut CilAssembly,
        external: ExternalRef,
    ) -> Result<Token> {
        if let Some(token) = self.resolved.get(&external) {
            return Ok(*token);
        }

        let token = match external {
            ExternalRef::Int32Type => self.type_token(assembly, "System", "Int32")?,
            ExternalRef::ByteType => self.type_token(assembly, "System", "Byte")?,
            ExternalRef::ObjectType => self.type_token(assembly, "System", "Object")?,
            ExternalRef::MutexType => self.type_token(assembly, "System.Threading", "Mutex")?,
            ExternalRef::Int32ArrayType => {
                let spec = TypeSpecBuilder::new()
                    .single_dimensional_array(TypeSignature::I4)
                    .build(assembly)?;
                Token::from_parts(TableId::TypeSpec, spec.placeholder())
            }
            ExternalRef::ObjectCtor => {
                let sig = instance_sig(TypeSignature::Void, vec![]);
                self.member(assembly, "System", "Object", ".ctor", &sig)?
            }
            ExternalRef::InterlockedIncrement => {
                let mut sig = static_sig(TypeSignature::I4, vec![TypeSignature::I4]);
                sig.params[0].by_ref = true;
                self.member(
                    assembly,
                    "System.Threading",
                    "Interlocked",
                    "Increment",
                    &sig,
                )?
            }
            ExternalRef::MonitorEnter => {
                let sig = static_sig(TypeSignature::Void, vec![TypeSignature::Object]);
                self.member(assembly, "System.Threading", "Monitor", "Enter", &sig)?
            }
            ExternalRef::MonitorExit => {
                let sig = static_sig(TypeSignature::Void, vec![TypeSignature::Object]);
                self.member(assembly, "System.Threading", "Monitor", "Exit", &sig)?
            }
            ExternalRef::MutexCtor => {
                let sig = instance_sig(
                    TypeSignature::Void,
                    vec![TypeSignature::Boolean, TypeSignature::String],
                );
                self.member(assembly, "System.Threading", "Mutex", ".ctor", &sig)?
            }
            ExternalRef::MutexWaitOne => {
                let sig = instance_sig(TypeSignature::Boolean, vec![]);
                self.member(assembly, "System.Threading", "Mutex", "WaitOne", &sig)?
            }
            ExternalRef::MutexReleaseMutex => {
                let sig = instance_sig(TypeSignature::Void, vec![]);
                self.member(assembly, "System.Threading", "Mutex", "ReleaseMutex", &sig)?
            }
            ExternalRef::FileExists => {
                let sig = static_sig(TypeSignature::Boolean, vec![TypeSignature::String]);
                self.member(assembly, "System.IO", "File", "Exists", &sig)?
            }
            ExternalRef::FileReadAllBytes => {
                let sig = static_sig(byte_array(), vec![TypeSignature::String]);
                self.member(assembly, "System.IO", "File", "ReadAllBytes", &sig)?
            }
            ExternalRef::FileWriteAllBytes => {
                let sig = static_sig(
                    TypeSignature::Void,
                    vec![TypeSignature::String, byte_array()],
                );
                self.member(assembly, "System.IO", "File", "WriteAllBytes", &sig)?
            }
            ExternalRef::AppDomainGetCurrent => {
                let appdomain = self.type_token(assembly, "System", "AppDomain")?;
                let sig = static_sig(TypeSignature::Class(appdomain), vec![]);
                self.member(assembly, "System", "AppDomain", "get_CurrentDomain", &sig)?
            }
            ExternalRef::AppDomainAddProcessExit => {
                let handler = self.type_token(assembly, "System", "EventHandler")?;
                let sig = instance_sig(TypeSignature::Void, vec![TypeSignature::Class(handler)]);
                self.member(assembly, "System", "AppDomain", "add_ProcessExit", &sig)?
            }
            ExternalRef::AppDomainAddDomainUnload => {
                let handler = self.type_token(assembly, "System", "EventHandler")?;
                let sig = instance_sig(TypeSignature::Void, vec![TypeSignature::Class(handler)]);
                self.member(assembly, "System", "AppDomain", "add_DomainUnload", &sig)?
            }
            ExternalRef::EventHandlerCtor => {
                let sig = instance_sig(
                    TypeSignature::Void,
                    vec![TypeSignature::Object, TypeSignature::I],
                );
                self.member(assembly, "System", "EventHandler", ".ctor", &sig)?
            }
            ExternalRef::InvalidOperationCtor => {
                let sig = instance_sig(TypeSignature::Void, vec![TypeSignature::String]);
                self.member(
                    assembly,
                    "System",
                    "InvalidOperationException",
                    ".ctor",
                    &sig,
                )?
            }
            ExternalRef::ThreadStaticCtor => {
                let sig = instance_sig(TypeSignature::Void, vec![]);
                self.member(assembly, "System", "ThreadStaticAttribute", ".ctor", &sig)?
            }
        };

        self.resolved.insert(external, token);
        Ok(token)
    }

    /// TypeRef token for `namespace.name` in the corlib scope.
    fn type_token(
        &mut self,
        assembly: &mut CilAssembly,
        namespace: &'static str,
        name: &'static str,
    ) -> Result<Token> {
        let rid = self.typeref(assembly, namespace, name)?;
        Ok(Token::from_parts(TableId::TypeRef, rid))
    }

    fn typeref(
        &mut self,
        assembly: &mut CilAssembly,
        namespace: &'static str,
        name: &'static str,
    ) -> Result<u32> {
        if let Some(rid) = self.typerefs.get(&(namespace, name)) {
            return Ok(*rid);
        }

        let created = TypeRefBuilder::new()
            .name(name)
            .namespace(namespace)
            .resolution_scope(CodedIndex::new(
                TableId::AssemblyRef,
                self.corlib_rid,
                CodedIndexType::ResolutionScope,
            ))
            .build(assembly)?;
        let rid = created.placeholder();
        self.typerefs.insert((namespace, name), rid);
        Ok(rid)
    }

    fn member(
        &mut self,
        assembly: &mut CilAssembly,
        namespace: &'static str,
        type_name: &'static str,
        member_name: &str,
        signature: &SignatureMethod,
    ) -> Result<Token> {
        let parent_rid = self.typeref(assembly, namespace, type_name)?;
        let blob = encode_method_signature(signature)?;

        let created = MemberRefBuilder::new()
            .name(member_name)
            .class(CodedIndex::new(
                TableId::TypeRef,
                parent_rid,
                CodedIndexType::MemberRefParent,
            ))
            .signature(&blob)
            .build(assembly)?;
        created
            .placeholder_token()
            .ok_or_else(|| Error::TemplateNotFound("member reference token"))
    }
}

fn static_sig(return_type: TypeSignature, params: Vec<TypeSignature>) -> SignatureMethod {
    SignatureMethod {
        default: true,
        param_count: params.len() as u32,
        return_type: SignatureParameter {
            modifiers: CustomModifiers::default(),
            by_ref: false,
            base: return_type,
        },
        params: params
            .into_iter()
            .map(|base| SignatureParameter {
                modifiers: CustomModifiers::default(),
                by_ref: false,
                base,
            })
            .collect(),
        ..SignatureMethod::default()
    }
}

fn instance_sig(return_type: TypeSignature, params: Vec<TypeSignature>) -> SignatureMethod {
    SignatureMethod {
        has_this: true,
        ..static_sig(return_type, params)
    }
}

fn byte_array() -> TypeSignature {
    TypeSignature::SzArray(SignatureSzArray {
        modifiers: CustomModifiers::default(),
        base: Box::new(TypeSignature::U1),
    })
}

fn int32_array() -> TypeSignature {
    TypeSignature::SzArray(SignatureSzArray {
        modifiers: CustomModifiers::default(),
        base: Box::new(TypeSignature::I4),
    })
}

fn int32_array_array() -> TypeSignature {
    TypeSignature::SzArray(SignatureSzArray {
        modifiers: CustomModifiers::default(),
        base: Box::new(int32_array()),
    })
}

/// The cloned tracker inside one target module.
pub(crate) struct TrackerInjector {
    type_name: String,
    hits_file_path: String,
    mutex_name: String,
    fields: HashMap<TemplateField, Token>,
    method_base_rid: u32,
}

impl TrackerInjector {
    /// Creates the clone type, its fields, and every method except the
    /// class initialiser.
    pub(crate) fn inject(
        assembly: &mut CilAssembly,
        imports: &mut ImportCache,
        module_basename: &str,
        identifier: &str,
        hits_file_path: &str,
    ) -> Result<Self> {
        let type_name = format!("{module_basename}_{identifier}");
        let hits_basename = std::path::Path::new(hits_file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| hits_file_path.to_string());
        let mutex_name = format!("{hits_basename}{}", crate::hits::MUTEX_SUFFIX);

        let object_rid = imports.typeref(assembly, "System", "Object")?;
        let field_list = assembly.next_rid(TableId::Field)?;
        let method_list = assembly.next_rid(TableId::MethodDef)?;

        TypeDefBuilder::new()
            .name(&type_name)
            .namespace(TRACKER_NAMESPACE)
            .flags(0x0010_0001) // Public | BeforeFieldInit
            .extends(CodedIndex::new(
                TableId::TypeRef,
                object_rid,
                CodedIndexType::TypeDefOrRef,
            ))
            .field_list(field_list)
            .method_list(method_list)
            .build(assembly)?;

        let mut fields = HashMap::new();
        for field in TemplateField::ALL {
            let signature = encode_field_signature(&SignatureField {
                modifiers: CustomModifiers::default(),
                base: field_type(field),
            })?;

            let rid = assembly.next_rid(TableId::Field)?;
            let token = Token::from_parts(TableId::Field, rid);
            let name_index = assembly.string_add(field.name())?.placeholder();
            let signature_index = assembly.blob_add(&signature)?.placeholder();
            assembly.table_row_add(
                TableId::Field,
                TableDataOwned::Field(FieldRaw {
                    rid,
                    token,
                    offset: 0,
                    flags: field.flags(),
                    name: name_index,
                    signature: signature_index,
                }),
            )?;
            fields.insert(field, token);

            if field.is_thread_static() {
                let ctor = imports.resolve(assembly, ExternalRef::ThreadStaticCtor)?;
                CustomAttributeBuilder::new()
                    .parent(CodedIndex::new(
                        TableId::Field,
                        rid,
                        CodedIndexType::HasCustomAttribute,
                    ))
                    .constructor(CodedIndex::new(
                        TableId::MemberRef,
                        ctor.row(),
                        CodedIndexType::CustomAttributeType,
                    ))
                    .value(&[0x01, 0x00, 0x00, 0x00])
                    .build(assembly)?;
            }
        }

        let injector = TrackerInjector {
            type_name,
            hits_file_path: hits_file_path.to_string(),
            mutex_name,
            fields,
            method_base_rid: assembly.next_rid(TableId::MethodDef)?,
        };

        for method in TemplateMethod::ALL {
            let body = injector.encode_body(
                assembly,
                imports,
                method.body(),
                method.locals(),
                None,
            )?;
            let rva = assembly.store_method_body(body);
            MethodDefBuilder::new()
                .name(method.name())
                .flags(method.flags())
                .impl_flags(0)
                .signature(&encode_method_signature(&method_signature(method))?)
                .rva(rva)
                .param_list(assembly.next_rid(TableId::Param)?)
                .build(assembly)?;
        }

        Ok(injector)
    }

    /// Name of the clone type.
    pub(crate) fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Field token of the clone's counter array.
    pub(crate) fn hits_array(&self) -> Result<Token> {
        self.field(TemplateField::HitsArray)
    }

    fn field(&self, field: TemplateField) -> Result<Token> {
        self.fields
            .get(&field)
            .copied()
            .ok_or_else(|| Error::TemplateNotFound(field.name()))
    }

    /// MethodDef token of a template method's clone.
    fn method_token(&self, method: TemplateMethod) -> Token {
        Token::from_parts(TableId::MethodDef, self.method_base_rid + method.index())
    }

    /// Emits the class initialiser: the template body with the
    /// counter-array/path initialisation spliced before its terminator.
    pub(crate) fn finish(
        &self,
        assembly: &mut CilAssembly,
        imports: &mut ImportCache,
        hit_count: usize,
    ) -> Result<()> {
        let init = InitSplice {
            hit_count: hit_count as i32,
            hits_array: self.field(TemplateField::HitsArray)?,
            hits_file_path: self.field(TemplateField::HitsFilePath)?,
            path: self.hits_file_path.clone(),
        };

        let body = self.encode_body(assembly, imports, CCTOR, &[], Some(&init))?;
        let rva = assembly.store_method_body(body);
        MethodDefBuilder::new()
            .name(".cctor")
            .flags(0x1891) // Private | Static | HideBySig | SpecialName | RTSpecialName
            .impl_flags(0)
            .signature(&encode_method_signature(&static_sig(
                TypeSignature::Void,
                vec![],
            ))?)
            .rva(rva)
            .param_list(assembly.next_rid(TableId::Param)?)
            .build(assembly)?;
        Ok(())
    }

    /// Encodes one template body, resolving every role to a token.
    fn encode_body(
        &self,
        assembly: &mut CilAssembly,
        imports: &mut ImportCache,
        body: &[Inst],
        locals: &[TemplateLocal],
        init: Option<&InitSplice>,
    ) -> Result<Vec<u8>> {
        let local_var_sig_token = if locals.is_empty() {
            0
        } else {
            let variables = SignatureLocalVariables {
                locals: locals
                    .iter()
                    .map(|local| {
                        Ok(SignatureLocalVariable {
                            modifiers: CustomModifiers::default(),
                            is_byref: false,
                            is_pinned: false,
                            base: match local {
                                TemplateLocal::Int32 => TypeSignature::I4,
                                TemplateLocal::Int32Array => int32_array(),
                                TemplateLocal::Int32ArrayArray => int32_array_array(),
                                TemplateLocal::ByteArray => byte_array(),
                                TemplateLocal::Mutex => TypeSignature::Class(
                                    imports.resolve(assembly, ExternalRef::MutexType)?,
                                ),
                            },
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            };
            let encoded = encode_local_var_signature(&variables)?;
            let sig = StandAloneSigBuilder::new()
                .signature(&encoded)
                .build(assembly)?;
            Token::from_parts(TableId::StandAloneSig, sig.placeholder()).value()
        };

        let mut encoder = InstructionEncoder::new();
        for inst in body {
            // The terminator comes last in every template body; the
            // initialisation splice goes directly in front of it.
            if let (Some(init), Inst::Op("ret")) = (init, inst) {
                self.emit_init(assembly, imports, &mut encoder, init)?;
            }
            self.emit(assembly, imports, &mut encoder, inst)?;
        }

        let (bytecode, max_stack, _labels) = encoder.finalize()?;
        let mut method_body = encode_method_body_header(
            bytecode.len() as u32,
            max_stack.max(8),
            local_var_sig_token,
            false,
            local_var_sig_token != 0,
        )?;
        method_body.extend_from_slice(&bytecode);
        Ok(method_body)
    }

    fn emit(
        &self,
        assembly: &mut CilAssembly,
        imports: &mut ImportCache,
        encoder: &mut InstructionEncoder,
        inst: &Inst,
    ) -> Result<()> {
        match inst {
            Inst::Op(mnemonic) => encoder.emit_instruction(mnemonic, None)?,
            Inst::I4(value) => encoder.emit_ldc_i4(*value)?,
            Inst::Arg(slot) => encoder.emit_ldarg(*slot)?,
            Inst::LdLoc(slot) => encoder.emit_ldloc(*slot)?,
            Inst::StLoc(slot) => encoder.emit_stloc(*slot)?,
            Inst::Field(mnemonic, field) => {
                let token = self.field(*field)?;
                encoder.emit_instruction(mnemonic, Some(Operand::Token(token)))?;
            }
            Inst::External(mnemonic, external, args, pushes) => {
                let token = imports.resolve(assembly, *external)?;
                emit_with_token(encoder, mnemonic, token, *args, *pushes)?;
            }
            Inst::Method(mnemonic, method, args, pushes) => {
                let token = self.method_token(*method);
                emit_with_token(encoder, mnemonic, token, *args, *pushes)?;
            }
            Inst::Str(role) => {
                let value = match role {
                    TemplateStr::MutexName => self.mutex_name.clone(),
                    TemplateStr::MismatchMessage => format!(
                        "hit counter file does not match the instrumentation of {}",
                        self.type_name
                    ),
                };
                let token = user_string_token(assembly, &value)?;
                encoder.emit_instruction("ldstr", Some(Operand::Token(token)))?;
            }
            Inst::Label(name) => encoder.define_label(name)?,
            Inst::Branch(mnemonic, target) => encoder.emit_branch(mnemonic, target)?,
        }
        Ok(())
    }

    /// The five-instruction initialisation: hit count, counter array,
    /// store, path literal, store.
    fn emit_init(
        &self,
        assembly: &mut CilAssembly,
        imports: &mut ImportCache,
        encoder: &mut InstructionEncoder,
        init: &InitSplice,
    ) -> Result<()> {
        let int32 = imports.resolve(assembly, ExternalRef::Int32Type)?;
        let path = user_string_token(assembly, &init.path)?;

        encoder.emit_ldc_i4(init.hit_count)?;
        encoder.emit_instruction("newarr", Some(Operand::Token(int32)))?;
        encoder.emit_instruction("stsfld", Some(Operand::Token(init.hits_array)))?;
        encoder.emit_instruction("ldstr", Some(Operand::Token(path)))?;
        encoder.emit_instruction("stsfld", Some(Operand::Token(init.hits_file_path)))?;
        Ok(())
    }
}

struct InitSplice {
    hit_count: i32,
    hits_array: Token,
    hits_file_path: Token,
    path: String,
}

/// Allocates a user string and returns the `ldstr` token for it.
pub(crate) fn user_string_token(assembly: &mut CilAssembly, value: &str) -> Result<Token> {
    let added = assembly.userstring_add(value)?;
    Ok(Token::new(0x7000_0000 | added.placeholder()))
}

fn emit_with_token(
    encoder: &mut InstructionEncoder,
    mnemonic: &str,
    token: Token,
    args: u8,
    pushes: bool,
) -> Result<()> {
    match mnemonic {
        "call" | "callvirt" | "newobj" => {
            encoder.emit_call(mnemonic, Some(Operand::Token(token)), args, pushes)?;
        }
        _ => encoder.emit_instruction(mnemonic, Some(Operand::Token(token)))?,
    }
    Ok(())
}

fn field_type(field: TemplateField) -> TypeSignature {
    match field {
        TemplateField::HitsArray | TemplateField::ThreadHits => int32_array(),
        TemplateField::HitsFilePath => TypeSignature::String,
        TemplateField::Threads => int32_array_array(),
        TemplateField::ThreadCount => TypeSignature::I4,
        TemplateField::Sync => TypeSignature::Object,
    }
}

fn method_signature(method: TemplateMethod) -> SignatureMethod {
    match method {
        TemplateMethod::RecordHit => static_sig(TypeSignature::Void, vec![TypeSignature::I4]),
        TemplateMethod::RegisterThread => static_sig(TypeSignature::Void, vec![]),
        TemplateMethod::UnloadModule => static_sig(
            TypeSignature::Void,
            vec![TypeSignature::Object, TypeSignature::Object],
        ),
        TemplateMethod::ReadCounter => {
            static_sig(TypeSignature::I4, vec![byte_array(), TypeSignature::I4])
        }
        TemplateMethod::WriteCounter => static_sig(
            TypeSignature::Void,
            vec![byte_array(), TypeSignature::I4, TypeSignature::I4],
        ),
    }
}
