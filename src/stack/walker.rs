//! The single stack-walk engine shared by dumping, root scanning and
//! exception dispatch.

use std::sync::Arc;

use super::{CodeIntrospection, Context, Frame, FrameId, ManagedStack, Method, QuickFrame, ShadowFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkMode {
    /// Only managed frames are visited.
    #[default]
    Normal,
    /// Upcall frames are visited too, as frames without a method.
    IncludeTransitions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Completed,
    Stopped,
}

/// A frame as presented to a visitor.
pub struct FrameView<'w> {
    frame: &'w Frame,
    depth: usize,
    code: &'w dyn CodeIntrospection,
    context: Option<&'w Context>,
}

impl<'w> FrameView<'w> {
    pub fn frame(&self) -> &'w Frame {
        self.frame
    }

    pub fn id(&self) -> FrameId {
        self.frame.id()
    }

    /// Position among the visited frames, 0 for the innermost.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// `None` for an upcall frame.
    pub fn method(&self) -> Option<&'w Arc<Method>> {
        self.frame.method()
    }

    pub fn native_pc(&self) -> Option<usize> {
        match self.frame {
            Frame::Quick(frame) => Some(frame.native_pc),
            Frame::Upcall(frame) => Some(frame.native_pc),
            Frame::Shadow(_) => None,
        }
    }

    pub fn dex_pc(&self) -> Option<u32> {
        match self.frame {
            Frame::Quick(frame) if !frame.method.is_native() && !frame.method.is_runtime() => {
                Some(self.code.dex_pc_for_native_pc(&frame.method, frame.native_pc))
            }
            Frame::Shadow(frame) => Some(frame.dex_pc),
            _ => None,
        }
    }

    pub fn line_number(&self) -> Option<i32> {
        let method = self.method()?;
        let dex_pc = self.dex_pc()?;
        self.code.line_number(method, dex_pc)
    }

    pub fn shadow_frame(&self) -> Option<&'w ShadowFrame> {
        match self.frame {
            Frame::Shadow(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn quick_frame(&self) -> Option<&'w QuickFrame> {
        match self.frame {
            Frame::Quick(frame) => Some(frame),
            _ => None,
        }
    }

    /// The register context for this frame, when the walk carries one.
    pub fn context(&self) -> Option<&'w Context> {
        self.context
    }

    pub fn code(&self) -> &'w dyn CodeIntrospection {
        self.code
    }
}

pub trait StackVisitor {
    fn visit_frame(&mut self, frame: &FrameView<'_>) -> WalkControl;
}

/// Adapts a closure into a [`StackVisitor`].
pub struct FnVisitor<F>(F);

pub fn visit_fn<F>(f: F) -> FnVisitor<F>
where
    F: FnMut(&FrameView<'_>) -> WalkControl,
{
    FnVisitor(f)
}

impl<F> StackVisitor for FnVisitor<F>
where
    F: FnMut(&FrameView<'_>) -> WalkControl,
{
    fn visit_frame(&mut self, frame: &FrameView<'_>) -> WalkControl {
        (self.0)(frame)
    }
}

/// Walks a [`ManagedStack`] from the innermost frame outwards.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use vmthread::stack::{ManagedStack, Method, StackWalker, WalkControl, visit_fn};
/// use vmthread::test_utils::MockCode;
/// use vmthread::ClassRef;
///
/// let mut stack = ManagedStack::new();
/// stack.push_upcall(0);
/// stack.push_shadow(Arc::new(Method::new("outer", ClassRef(1), "LFoo;")), 0, vec![]);
/// stack.push_shadow(Arc::new(Method::new("inner", ClassRef(1), "LFoo;")), 4, vec![]);
///
/// let code = MockCode::new();
/// let mut names = Vec::new();
/// StackWalker::new(&stack, &code).walk(&mut visit_fn(|frame| {
///     names.push(frame.method().unwrap().name.clone());
///     WalkControl::Continue
/// }));
/// assert_eq!(names, ["inner", "outer"]);
/// ```
pub struct StackWalker<'a> {
    stack: &'a ManagedStack,
    code: &'a dyn CodeIntrospection,
    context: Option<&'a mut Context>,
    mode: WalkMode,
    skip: usize,
}

impl<'a> StackWalker<'a> {
    pub fn new(stack: &'a ManagedStack, code: &'a dyn CodeIntrospection) -> Self {
        Self {
            stack,
            code,
            context: None,
            mode: WalkMode::Normal,
            skip: 0,
        }
    }

    /// Tracks register contents frame by frame in `context`.
    pub fn with_context(mut self, context: &'a mut Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn mode(mut self, mode: WalkMode) -> Self {
        self.mode = mode;
        self
    }

    /// Hides the `skip` innermost managed frames from the visitor.
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn walk<V>(self, visitor: &mut V) -> WalkOutcome
    where
        V: StackVisitor + ?Sized,
    {
        let Self {
            stack,
            code,
            mut context,
            mode,
            skip,
        } = self;

        if let Some(context) = context.as_deref_mut() {
            context.reset();
            context.load(stack.top_registers());
        }

        let mut skipped = 0;
        let mut depth = 0;
        for frame in stack.iter_innermost_first() {
            let visible = match frame {
                Frame::Upcall(_) => mode == WalkMode::IncludeTransitions,
                Frame::Quick(_) | Frame::Shadow(_) => {
                    if skipped < skip {
                        skipped += 1;
                        false
                    } else {
                        true
                    }
                }
            };

            if visible {
                let view = FrameView {
                    frame,
                    depth,
                    code,
                    context: context.as_deref(),
                };
                depth += 1;
                if visitor.visit_frame(&view) == WalkControl::Stop {
                    return WalkOutcome::Stopped;
                }
            }

            if let (Frame::Quick(quick), Some(context)) = (frame, context.as_deref_mut()) {
                context.fill_callee_saves(&quick.callee_saves);
            }
        }
        WalkOutcome::Completed
    }
}
