//! Managed call stacks.
//!
//! A thread's [`ManagedStack`] is the chain of frames of managed code it is
//! executing: compiled frames, interpreter frames and the upcall markers left
//! where native code called in. [`StackWalker`] visits that chain from the
//! innermost frame outwards, optionally tracking machine registers in a
//! [`Context`] so register-resident locals can be read.

mod code;
mod context;
mod frame;
mod method;
mod walker;

pub use code::{CodeIntrospection, ReferenceBitmap, VRegLocation};
pub use context::{Context, GPR_COUNT};
pub use frame::{Frame, FrameId, ManagedStack, QuickFrame, ShadowFrame, UpcallFrame};
pub use method::{CatchHandler, Method, MethodFlags};
pub use walker::{FnVisitor, FrameView, StackVisitor, StackWalker, WalkControl, WalkMode, WalkOutcome, visit_fn};
