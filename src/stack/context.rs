//! Machine register context used while walking and for long jumps.

/// Number of general-purpose registers modelled.
pub const GPR_COUNT: usize = 16;

/// Registers a call may clobber; their values are unknown in any frame but
/// the innermost.
const CALLER_SAVES: [usize; 5] = [0, 1, 2, 3, 12];

/// Registers a handler may read as return values after a long jump.
const RETURN_REGISTERS: [usize; 2] = [0, 1];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    sp: usize,
    pc: usize,
    gprs: [Option<usize>; GPR_COUNT],
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            sp: 0,
            pc: 0,
            gprs: [None; GPR_COUNT],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    /// Value of `reg` in the frame being visited, if known.
    pub fn gpr(&self, reg: usize) -> Option<usize> {
        self.gprs.get(reg).copied().flatten()
    }

    pub fn set_gpr(&mut self, reg: usize, value: usize) {
        if reg >= GPR_COUNT {
            fatal!("register r{reg} does not exist");
        }
        self.gprs[reg] = Some(value);
    }

    /// Loads the register file captured at the top of the stack.
    pub fn load(&mut self, registers: &[(usize, usize)]) {
        for &(reg, value) in registers {
            self.set_gpr(reg, value);
        }
    }

    /// Moves the context from a frame to its caller: the registers the callee
    /// spilled are the caller's values, caller-save registers are lost.
    pub fn fill_callee_saves(&mut self, callee_saves: &[(usize, usize)]) {
        for reg in CALLER_SAVES {
            self.gprs[reg] = None;
        }
        self.load(callee_saves);
    }

    /// Invalidates caller-save registers before a long jump. Return registers
    /// are zeroed so the handler sees no stale result.
    pub fn smash_caller_saves(&mut self) {
        for reg in CALLER_SAVES {
            self.gprs[reg] = None;
        }
        for reg in RETURN_REGISTERS {
            self.gprs[reg] = Some(0);
        }
    }
}
