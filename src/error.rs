//! Typed errors carried inside `anyhow::Error`.
//!
//! Every fallible operation in this crate returns `anyhow::Result`; the types
//! here are attached so that callers can tell the failure classes apart with
//! `downcast_ref`.

use crate::abi::Val;
use crate::concurrent::{ComponentInstanceIndex, TaskId, TaskState};

/// The `err` case of a `result` returned by a guest export.
///
/// The payload is passed through verbatim; `None` means the error case
/// carries no payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("guest returned an error: {}", display_payload(.payload))]
pub struct GuestError {
    pub payload: Option<Val>,
}

fn display_payload(payload: &Option<Val>) -> String {
    match payload {
        Some(Val::String(s)) => s.clone(),
        Some(other) => format!("{other:?}"),
        None => "<no payload>".to_string(),
    }
}

/// Malformed data observed while lifting or lowering values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    #[error("invalid discriminant {value} for {ty}, expected a value in [0..{cases})")]
    InvalidDiscriminant {
        ty: &'static str,
        value: u32,
        cases: u32,
    },
    #[error("invalid bool value {0:#x}, expected 0 or 1")]
    InvalidBool(u32),
    #[error("invalid char code point {0:#x}")]
    InvalidChar(u32),
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("{what} out of bounds of linear memory")]
    OutOfBounds { what: &'static str },
    #[error("{what} pointer {ptr:#x} is not aligned to {align}")]
    Misaligned {
        what: &'static str,
        ptr: u32,
        align: u32,
    },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: String,
        found: &'static str,
    },
    #[error("invalid flag `{0}`")]
    UnknownFlag(String),
    #[error("flags type has {0} names, more than the limit of {max}", max = crate::abi::MAX_FLAGS)]
    TooManyFlags(usize),
    #[error("instance does not export a linear memory")]
    MissingMemory,
    #[error("instance does not export a `realloc` function")]
    MissingRealloc,
}

/// Misuse of the task or lock protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown component instance {0}")]
    UnknownInstance(ComponentInstanceIndex),
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    #[error("component instance {instance} has no running task")]
    EmptyTaskStack { instance: ComponentInstanceIndex },
    #[error("task stack mismatch on instance {instance}: expected {expected}, found {found}")]
    TaskStackMismatch {
        instance: ComponentInstanceIndex,
        expected: TaskId,
        found: TaskId,
    },
    #[error("task {0} has already been resolved")]
    DoubleResolve(TaskId),
    #[error("task {task} still holds {count} borrowed handle(s)")]
    BorrowedHandles { task: TaskId, count: usize },
    #[error("task {task} cannot {op} in state {state:?}")]
    InvalidState {
        task: TaskId,
        op: &'static str,
        state: TaskState,
    },
    #[error("task {0} received a second cancellation during an uncancellable wait")]
    DoubleCancel(TaskId),
    #[error("task {0} is not blocked and cannot be cancelled")]
    NotBlocked(TaskId),
    #[error("task {0} is already blocked")]
    AlreadyBlocked(TaskId),
    #[error("task {0} is synchronous and cannot block for a callback")]
    SyncCallbackBlock(TaskId),
    #[error("task {0} still has live subtasks")]
    LiveSubtasks(TaskId),
    #[error("subtask stack mismatch on task {task}")]
    SubtaskMismatch { task: TaskId },
    #[error("handle {handle} is not borrowed by task {task}")]
    NotBorrowed { task: TaskId, handle: u32 },
    #[error("invalid context slot {0}")]
    InvalidContextSlot(u32),
    #[error("handle {0} is not a waitable")]
    NotAWaitable(u32),
    #[error("handle {0} is not a waitable set")]
    NotAWaitableSet(u32),
    #[error("waitable set {0} still has members")]
    WaitableSetNotEmpty(u32),
    #[error("waitable {0} still has tasks parked on it")]
    WaitableBusy(u32),
    #[error("cannot enter component instance {0}")]
    CannotEnter(ComponentInstanceIndex),
    #[error("cannot leave component instance {0}")]
    CannotLeave(ComponentInstanceIndex),
    #[error("exclusive lock of instance {0} was abandoned")]
    LockAbandoned(ComponentInstanceIndex),
    #[error("concurrent state was poisoned by a panic")]
    Poisoned,
}

/// An operation that exists in the calling convention but has no
/// implementation here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unsupported operation: {0}")]
pub struct Unsupported(pub &'static str);

/// Failures while resolving modules or wiring imports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("unknown module `{0}`")]
    UnknownModule(String),
    #[error("{stage} module import `{module}::{name}` could not be resolved")]
    UnresolvedImport {
        stage: &'static str,
        module: String,
        name: String,
    },
    #[error("host import `{interface}#{name}` was not provided")]
    MissingHostImport { interface: String, name: String },
    #[error("core export `{0}` is missing from the main module")]
    MissingExport(String),
    #[error("export `{name}` expected {expected} argument(s), got {got}")]
    ArgumentCount {
        name: String,
        expected: usize,
        got: usize,
    },
}
