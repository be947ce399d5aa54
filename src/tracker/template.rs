//! The tracker template: fields, method signatures, and IL bodies with
//! role-keyed operands.
//!
//! The template is data, not compiled code. Operands that cross the
//! template boundary are expressed as roles — a template field, a
//! template method, an imported external member, or a string the
//! injector supplies — and resolved to metadata tokens at injection
//! time. The enums here are exhaustive, which makes the rewrite in
//! [`crate::tracker::TrackerInjector`] total: a template body cannot
//! reference something the injector does not know how to resolve.
//!
//! Runtime behaviour carried by the bodies:
//!
//! - `RecordHit(i)` increments the calling thread's private counter
//!   array, registering the thread on first use under the registry lock.
//! - `UnloadModule(sender, args)` merges every per-thread array into the
//!   shared `HitsArray` under the registry lock, clears the registry,
//!   then creates or accumulates the hit file under the named mutex and
//!   zeroes `HitsArray` so a second unload hook contributes nothing.
//! - The class initialiser wires `UnloadModule` to both process-exit and
//!   domain-unload and receives the counter-array/path initialisation
//!   splice from the injector once the final hit count is known.

/// Static fields of the tracker type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TemplateField {
    /// `int32[]` — the shared per-module counter array. Pinned by name.
    HitsArray,
    /// `string` — where the runtime persists counts. Pinned by name.
    HitsFilePath,
    /// `int32[]`, thread-static — the calling thread's counters.
    ThreadHits,
    /// `int32[][]` — registry of all per-thread arrays.
    Threads,
    /// `int32` — number of live registry entries.
    ThreadCount,
    /// `object` — the registry lock.
    Sync,
}

impl TemplateField {
    pub(crate) const ALL: [TemplateField; 6] = [
        TemplateField::HitsArray,
        TemplateField::HitsFilePath,
        TemplateField::ThreadHits,
        TemplateField::Threads,
        TemplateField::ThreadCount,
        TemplateField::Sync,
    ];

    /// Field name in the cloned type.
    pub(crate) fn name(self) -> &'static str {
        match self {
            TemplateField::HitsArray => "HitsArray",
            TemplateField::HitsFilePath => "HitsFilePath",
            TemplateField::ThreadHits => "t_threadHits",
            TemplateField::Threads => "_threads",
            TemplateField::ThreadCount => "_threadCount",
            TemplateField::Sync => "_sync",
        }
    }

    /// ECMA field attributes: the pinned fields are public so host
    /// tooling can reach them, the rest are private. All static.
    pub(crate) fn flags(self) -> u32 {
        match self {
            TemplateField::HitsArray | TemplateField::HitsFilePath => 0x0016, // Public | Static
            _ => 0x0011, // Private | Static
        }
    }

    /// True for the field that carries `[ThreadStatic]`.
    pub(crate) fn is_thread_static(self) -> bool {
        matches!(self, TemplateField::ThreadHits)
    }
}

/// Methods of the tracker type, in MethodDef emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TemplateMethod {
    /// `public static void RecordHit(int32)`
    RecordHit,
    /// `static void RegisterThread()` — the once-per-thread slow path.
    RegisterThread,
    /// `public static void UnloadModule(object, object)`
    UnloadModule,
    /// `static int32 ReadCounter(uint8[], int32)`
    ReadCounter,
    /// `static void WriteCounter(uint8[], int32, int32)`
    WriteCounter,
}

impl TemplateMethod {
    /// Emission order; the class initialiser is emitted separately after
    /// instrumentation has fixed the hit count.
    pub(crate) const ALL: [TemplateMethod; 5] = [
        TemplateMethod::RecordHit,
        TemplateMethod::RegisterThread,
        TemplateMethod::UnloadModule,
        TemplateMethod::ReadCounter,
        TemplateMethod::WriteCounter,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            TemplateMethod::RecordHit => "RecordHit",
            TemplateMethod::RegisterThread => "RegisterThread",
            TemplateMethod::UnloadModule => "UnloadModule",
            TemplateMethod::ReadCounter => "ReadCounter",
            TemplateMethod::WriteCounter => "WriteCounter",
        }
    }

    /// ECMA method attributes.
    pub(crate) fn flags(self) -> u32 {
        match self {
            // Public | Static | HideBySig
            TemplateMethod::RecordHit | TemplateMethod::UnloadModule => 0x0096,
            // Private | Static | HideBySig
            _ => 0x0091,
        }
    }

    /// Position in [`TemplateMethod::ALL`], used for MethodDef RID
    /// precomputation.
    pub(crate) fn index(self) -> u32 {
        TemplateMethod::ALL
            .iter()
            .position(|m| *m == self)
            .unwrap_or(0) as u32
    }

    /// The body as role-keyed instructions.
    pub(crate) fn body(self) -> &'static [Inst] {
        match self {
            TemplateMethod::RecordHit => RECORD_HIT,
            TemplateMethod::RegisterThread => REGISTER_THREAD,
            TemplateMethod::UnloadModule => UNLOAD_MODULE,
            TemplateMethod::ReadCounter => READ_COUNTER,
            TemplateMethod::WriteCounter => WRITE_COUNTER,
        }
    }

    /// Local variable slots, in order.
    pub(crate) fn locals(self) -> &'static [TemplateLocal] {
        match self {
            TemplateMethod::RegisterThread => &[
                TemplateLocal::Int32ArrayArray, // grown registry
                TemplateLocal::Int32,           // copy index
            ],
            TemplateMethod::UnloadModule => &[
                TemplateLocal::Int32,      // thread index
                TemplateLocal::Int32Array, // current thread array
                TemplateLocal::Int32,      // slot index
                TemplateLocal::ByteArray,  // file image
                TemplateLocal::Mutex,      // named mutex
            ],
            _ => &[],
        }
    }
}

/// Local variable types a template body may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TemplateLocal {
    Int32,
    Int32Array,
    Int32ArrayArray,
    ByteArray,
    /// `System.Threading.Mutex`; resolved to the imported reference.
    Mutex,
}

/// External members the template imports into the target module.
///
/// Every variant resolves to exactly one metadata row (TypeRef, TypeSpec
/// or MemberRef); the injector creates each at most once per module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ExternalRef {
    /// `System.Int32` — `ldelema` / `newarr` element type.
    Int32Type,
    /// `System.Byte` — `newarr` element type for file images.
    ByteType,
    /// `System.Object`.
    ObjectType,
    /// `System.Threading.Mutex`.
    MutexType,
    /// `int32[]` type specification — registry element type.
    Int32ArrayType,
    /// `instance void System.Object::.ctor()`
    ObjectCtor,
    /// `static int32 System.Threading.Interlocked::Increment(int32&)`
    InterlockedIncrement,
    /// `static void System.Threading.Monitor::Enter(object)`
    MonitorEnter,
    /// `static void System.Threading.Monitor::Exit(object)`
    MonitorExit,
    /// `instance void System.Threading.Mutex::.ctor(bool, string)`
    MutexCtor,
    /// `instance bool System.Threading.Mutex::WaitOne()`
    MutexWaitOne,
    /// `instance void System.Threading.Mutex::ReleaseMutex()`
    MutexReleaseMutex,
    /// `static bool System.IO.File::Exists(string)`
    FileExists,
    /// `static uint8[] System.IO.File::ReadAllBytes(string)`
    FileReadAllBytes,
    /// `static void System.IO.File::WriteAllBytes(string, uint8[])`
    FileWriteAllBytes,
    /// `static class System.AppDomain System.AppDomain::get_CurrentDomain()`
    AppDomainGetCurrent,
    /// `instance void System.AppDomain::add_ProcessExit(class System.EventHandler)`
    AppDomainAddProcessExit,
    /// `instance void System.AppDomain::add_DomainUnload(class System.EventHandler)`
    AppDomainAddDomainUnload,
    /// `instance void System.EventHandler::.ctor(object, native int)`
    EventHandlerCtor,
    /// `instance void System.InvalidOperationException::.ctor(string)`
    InvalidOperationCtor,
    /// `instance void System.ThreadStaticAttribute::.ctor()`
    ThreadStaticCtor,
}

/// Strings the injector supplies at clone time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TemplateStr {
    /// Name of the named inter-process mutex.
    MutexName,
    /// Message of the hit-file length-mismatch exception.
    MismatchMessage,
}

/// One template instruction with a role-keyed operand.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Inst {
    /// Operand-free instruction.
    Op(&'static str),
    /// `ldc.i4` of a constant.
    I4(i32),
    /// `ldarg` of a slot.
    Arg(u16),
    /// Load a local slot.
    LdLoc(u16),
    /// Store a local slot.
    StLoc(u16),
    /// Field access; mnemonic is `ldsfld` or `stsfld`.
    Field(&'static str, TemplateField),
    /// Imported external reference operand; mnemonic decides the use.
    /// `(mnemonic, reference, argument count, pushes result)` — the call
    /// shape feeds the encoder's stack tracking.
    External(&'static str, ExternalRef, u8, bool),
    /// Intra-template method reference (`call` or `ldftn`); redirected
    /// to the clone type at injection.
    Method(&'static str, TemplateMethod, u8, bool),
    /// Injection-supplied string literal.
    Str(TemplateStr),
    /// Branch target definition.
    Label(&'static str),
    /// Branch; long form, re-optimised by the encoder.
    Branch(&'static str, &'static str),
}

use Inst::{Arg, Branch, External, Field, Label, LdLoc, Method, Op, StLoc, Str, I4};

/// `RecordHit(int32 index)`: fast path on the thread's own array.
static RECORD_HIT: &[Inst] = &[
    Field("ldsfld", TemplateField::ThreadHits),
    Branch("brtrue", "registered"),
    Method("call", TemplateMethod::RegisterThread, 0, false),
    Label("registered"),
    // t_threadHits[index] = t_threadHits[index] + 1, single writer.
    Field("ldsfld", TemplateField::ThreadHits),
    Arg(0),
    Field("ldsfld", TemplateField::ThreadHits),
    Arg(0),
    Op("ldelem.i4"),
    I4(1),
    Op("add"),
    Op("stelem.i4"),
    Op("ret"),
];

/// `RegisterThread()`: allocate and register this thread's array under
/// the registry lock, double-checking after acquisition.
static REGISTER_THREAD: &[Inst] = &[
    Field("ldsfld", TemplateField::Sync),
    External("call", ExternalRef::MonitorEnter, 1, false),
    Field("ldsfld", TemplateField::ThreadHits),
    Branch("brtrue", "release"),
    // t_threadHits = new int32[HitsArray.Length]
    Field("ldsfld", TemplateField::HitsArray),
    Op("ldlen"),
    Op("conv.i4"),
    External("newarr", ExternalRef::Int32Type, 0, true),
    Field("stsfld", TemplateField::ThreadHits),
    // grow the registry when full
    Field("ldsfld", TemplateField::ThreadCount),
    Field("ldsfld", TemplateField::Threads),
    Op("ldlen"),
    Op("conv.i4"),
    Branch("blt", "append"),
    I4(0),
    StLoc(1),
    Field("ldsfld", TemplateField::Threads),
    Op("ldlen"),
    Op("conv.i4"),
    I4(2),
    Op("mul"),
    External("newarr", ExternalRef::Int32ArrayType, 0, true),
    StLoc(0),
    Label("copy"),
    LdLoc(1),
    Field("ldsfld", TemplateField::ThreadCount),
    Branch("bge", "copied"),
    LdLoc(0),
    LdLoc(1),
    Field("ldsfld", TemplateField::Threads),
    LdLoc(1),
    Op("ldelem.ref"),
    Op("stelem.ref"),
    LdLoc(1),
    I4(1),
    Op("add"),
    StLoc(1),
    Branch("br", "copy"),
    Label("copied"),
    LdLoc(0),
    Field("stsfld", TemplateField::Threads),
    Label("append"),
    // _threads[_threadCount] = t_threadHits; _threadCount += 1
    Field("ldsfld", TemplateField::Threads),
    Field("ldsfld", TemplateField::ThreadCount),
    Field("ldsfld", TemplateField::ThreadHits),
    Op("stelem.ref"),
    Field("ldsfld", TemplateField::ThreadCount),
    I4(1),
    Op("add"),
    Field("stsfld", TemplateField::ThreadCount),
    Label("release"),
    Field("ldsfld", TemplateField::Sync),
    External("call", ExternalRef::MonitorExit, 1, false),
    Op("ret"),
];

/// `UnloadModule(object, object)`: merge, persist, zero.
static UNLOAD_MODULE: &[Inst] = &[
    // -- merge every per-thread array into HitsArray under the lock --
    Field("ldsfld", TemplateField::Sync),
    External("call", ExternalRef::MonitorEnter, 1, false),
    I4(0),
    StLoc(0),
    Label("thread_loop"),
    LdLoc(0),
    Field("ldsfld", TemplateField::ThreadCount),
    Branch("bge", "merged"),
    Field("ldsfld", TemplateField::Threads),
    LdLoc(0),
    Op("ldelem.ref"),
    StLoc(1),
    LdLoc(1),
    Branch("brfalse", "next_thread"),
    I4(0),
    StLoc(2),
    Label("slot_loop"),
    LdLoc(2),
    Field("ldsfld", TemplateField::HitsArray),
    Op("ldlen"),
    Op("conv.i4"),
    Branch("bge", "next_thread"),
    Field("ldsfld", TemplateField::HitsArray),
    LdLoc(2),
    Field("ldsfld", TemplateField::HitsArray),
    LdLoc(2),
    Op("ldelem.i4"),
    LdLoc(1),
    LdLoc(2),
    Op("ldelem.i4"),
    Op("add"),
    Op("stelem.i4"),
    LdLoc(2),
    I4(1),
    Op("add"),
    StLoc(2),
    Branch("br", "slot_loop"),
    Label("next_thread"),
    LdLoc(0),
    I4(1),
    Op("add"),
    StLoc(0),
    Branch("br", "thread_loop"),
    Label("merged"),
    // -- clear the registry; a repeat unload contributes zero --
    I4(0),
    StLoc(0),
    Label("clear_loop"),
    LdLoc(0),
    Field("ldsfld", TemplateField::ThreadCount),
    Branch("bge", "cleared"),
    Field("ldsfld", TemplateField::Threads),
    LdLoc(0),
    Op("ldnull"),
    Op("stelem.ref"),
    LdLoc(0),
    I4(1),
    Op("add"),
    StLoc(0),
    Branch("br", "clear_loop"),
    Label("cleared"),
    I4(0),
    Field("stsfld", TemplateField::ThreadCount),
    Field("ldsfld", TemplateField::Sync),
    External("call", ExternalRef::MonitorExit, 1, false),
    // -- exclusive create-or-accumulate of the hit file --
    I4(0),
    Str(TemplateStr::MutexName),
    External("newobj", ExternalRef::MutexCtor, 2, true),
    StLoc(4),
    LdLoc(4),
    External("callvirt", ExternalRef::MutexWaitOne, 1, true),
    Op("pop"),
    Field("ldsfld", TemplateField::HitsFilePath),
    External("call", ExternalRef::FileExists, 1, true),
    Branch("brfalse", "fresh"),
    // accumulate into the existing image
    Field("ldsfld", TemplateField::HitsFilePath),
    External("call", ExternalRef::FileReadAllBytes, 1, true),
    StLoc(3),
    LdLoc(3),
    I4(0),
    Method("call", TemplateMethod::ReadCounter, 2, true),
    Field("ldsfld", TemplateField::HitsArray),
    Op("ldlen"),
    Op("conv.i4"),
    Branch("beq", "lengths_match"),
    Str(TemplateStr::MismatchMessage),
    External("newobj", ExternalRef::InvalidOperationCtor, 1, true),
    Op("throw"),
    Label("lengths_match"),
    I4(0),
    StLoc(2),
    Label("accumulate_loop"),
    LdLoc(2),
    Field("ldsfld", TemplateField::HitsArray),
    Op("ldlen"),
    Op("conv.i4"),
    Branch("bge", "accumulated"),
    LdLoc(3),
    I4(4),
    LdLoc(2),
    I4(4),
    Op("mul"),
    Op("add"),
    LdLoc(3),
    I4(4),
    LdLoc(2),
    I4(4),
    Op("mul"),
    Op("add"),
    Method("call", TemplateMethod::ReadCounter, 2, true),
    Field("ldsfld", TemplateField::HitsArray),
    LdLoc(2),
    Op("ldelem.i4"),
    Op("add"),
    Method("call", TemplateMethod::WriteCounter, 3, false),
    LdLoc(2),
    I4(1),
    Op("add"),
    StLoc(2),
    Branch("br", "accumulate_loop"),
    Label("accumulated"),
    Field("ldsfld", TemplateField::HitsFilePath),
    LdLoc(3),
    External("call", ExternalRef::FileWriteAllBytes, 2, false),
    Branch("br", "persisted"),
    Label("fresh"),
    // image = new uint8[4 + 4 * HitsArray.Length], prefix, counters
    I4(4),
    Field("ldsfld", TemplateField::HitsArray),
    Op("ldlen"),
    Op("conv.i4"),
    I4(4),
    Op("mul"),
    Op("add"),
    External("newarr", ExternalRef::ByteType, 0, true),
    StLoc(3),
    LdLoc(3),
    I4(0),
    Field("ldsfld", TemplateField::HitsArray),
    Op("ldlen"),
    Op("conv.i4"),
    Method("call", TemplateMethod::WriteCounter, 3, false),
    I4(0),
    StLoc(2),
    Label("fill_loop"),
    LdLoc(2),
    Field("ldsfld", TemplateField::HitsArray),
    Op("ldlen"),
    Op("conv.i4"),
    Branch("bge", "filled"),
    LdLoc(3),
    I4(4),
    LdLoc(2),
    I4(4),
    Op("mul"),
    Op("add"),
    Field("ldsfld", TemplateField::HitsArray),
    LdLoc(2),
    Op("ldelem.i4"),
    Method("call", TemplateMethod::WriteCounter, 3, false),
    LdLoc(2),
    I4(1),
    Op("add"),
    StLoc(2),
    Branch("br", "fill_loop"),
    Label("filled"),
    Field("ldsfld", TemplateField::HitsFilePath),
    LdLoc(3),
    External("call", ExternalRef::FileWriteAllBytes, 2, false),
    Label("persisted"),
    LdLoc(4),
    External("callvirt", ExternalRef::MutexReleaseMutex, 1, false),
    // -- zero HitsArray: both unload hooks may fire --
    I4(0),
    StLoc(2),
    Label("zero_loop"),
    LdLoc(2),
    Field("ldsfld", TemplateField::HitsArray),
    Op("ldlen"),
    Op("conv.i4"),
    Branch("bge", "zeroed"),
    Field("ldsfld", TemplateField::HitsArray),
    LdLoc(2),
    I4(0),
    Op("stelem.i4"),
    LdLoc(2),
    I4(1),
    Op("add"),
    StLoc(2),
    Branch("br", "zero_loop"),
    Label("zeroed"),
    Op("ret"),
];

/// `ReadCounter(uint8[] image, int32 offset)`: little-endian load.
static READ_COUNTER: &[Inst] = &[
    Arg(0),
    Arg(1),
    Op("ldelem.u1"),
    Arg(0),
    Arg(1),
    I4(1),
    Op("add"),
    Op("ldelem.u1"),
    I4(8),
    Op("shl"),
    Op("or"),
    Arg(0),
    Arg(1),
    I4(2),
    Op("add"),
    Op("ldelem.u1"),
    I4(16),
    Op("shl"),
    Op("or"),
    Arg(0),
    Arg(1),
    I4(3),
    Op("add"),
    Op("ldelem.u1"),
    I4(24),
    Op("shl"),
    Op("or"),
    Op("ret"),
];

/// `WriteCounter(uint8[] image, int32 offset, int32 value)`:
/// little-endian store, whole-word overwrite.
static WRITE_COUNTER: &[Inst] = &[
    Arg(0),
    Arg(1),
    Arg(2),
    Op("conv.u1"),
    Op("stelem.i1"),
    Arg(0),
    Arg(1),
    I4(1),
    Op("add"),
    Arg(2),
    I4(8),
    Op("shr"),
    Op("conv.u1"),
    Op("stelem.i1"),
    Arg(0),
    Arg(1),
    I4(2),
    Op("add"),
    Arg(2),
    I4(16),
    Op("shr"),
    Op("conv.u1"),
    Op("stelem.i1"),
    Arg(0),
    Arg(1),
    I4(3),
    Op("add"),
    Arg(2),
    I4(24),
    Op("shr"),
    Op("conv.u1"),
    Op("stelem.i1"),
    Op("ret"),
];

/// Class-initialiser body, before the counter-array/path splice: set up
/// the registry and wire `UnloadModule` to both unload events.
pub(crate) static CCTOR: &[Inst] = &[
    External("newobj", ExternalRef::ObjectCtor, 0, true),
    Field("stsfld", TemplateField::Sync),
    I4(64),
    External("newarr", ExternalRef::Int32ArrayType, 0, true),
    Field("stsfld", TemplateField::Threads),
    I4(0),
    Field("stsfld", TemplateField::ThreadCount),
    External("call", ExternalRef::AppDomainGetCurrent, 0, true),
    Op("ldnull"),
    Method("ldftn", TemplateMethod::UnloadModule, 0, true),
    External("newobj", ExternalRef::EventHandlerCtor, 2, true),
    External("callvirt", ExternalRef::AppDomainAddProcessExit, 2, false),
    External("call", ExternalRef::AppDomainGetCurrent, 0, true),
    Op("ldnull"),
    Method("ldftn", TemplateMethod::UnloadModule, 0, true),
    External("newobj", ExternalRef::EventHandlerCtor, 2, true),
    External("callvirt", ExternalRef::AppDomainAddDomainUnload, 2, false),
    Op("ret"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_field_names_are_stable() {
        assert_eq!(TemplateField::HitsArray.name(), "HitsArray");
        assert_eq!(TemplateField::HitsFilePath.name(), "HitsFilePath");
    }

    #[test]
    fn method_order_is_stable() {
        assert_eq!(TemplateMethod::RecordHit.index(), 0);
        assert_eq!(TemplateMethod::UnloadModule.index(), 2);
    }

    #[test]
    fn every_branch_target_is_defined() {
        let mut bodies: Vec<&[Inst]> = TemplateMethod::ALL.iter().map(|m| m.body()).collect();
        bodies.push(CCTOR);

        for body in bodies {
            for inst in body {
                if let Inst::Branch(_, target) = inst {
                    assert!(
                        body.iter()
                            .any(|i| matches!(i, Inst::Label(l) if l == target)),
                        "undefined label {target}"
                    );
                }
            }
        }
    }

    #[test]
    fn bodies_terminate() {
        for method in TemplateMethod::ALL {
            assert!(matches!(method.body().last(), Some(Inst::Op("ret"))));
        }
        assert!(matches!(CCTOR.last(), Some(Inst::Op("ret"))));
    }

    #[test]
    fn locals_fit_referenced_slots() {
        for method in TemplateMethod::ALL {
            let local_count = method.locals().len() as u16;
            for inst in method.body() {
                if let Inst::LdLoc(slot) | Inst::StLoc(slot) = inst {
                    assert!(
                        *slot < local_count,
                        "{} uses local {slot} but declares {local_count}",
                        method.name()
                    );
                }
            }
        }
    }
}
