//! Human-readable thread diagnostics.
//!
//! The formats are meant for logs and ANR-style reports and carry no
//! compatibility guarantee.

use std::fmt;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{KB, MB};
use crate::object::{ObjectModel, ObjectRef, pretty_descriptor};
use crate::stack::{FrameView, Method, StackVisitor, StackWalker, WalkControl};
use crate::well_known;

use super::lifecycle::{nice_of, priority_for_nice};
use super::{Thread, ThreadState};

/// Identical consecutive frames printed before the rest of the run is
/// summarized.
pub const MAX_REPETITION: usize = 3;

const STACK_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// `2MB`, `16KB`, `100B`.
pub(crate) fn pretty_size(bytes: usize) -> String {
    if bytes >= MB && bytes % MB == 0 {
        format!("{}MB", bytes / MB)
    } else if bytes >= KB {
        format!("{}KB", bytes / KB)
    } else {
        format!("{bytes}B")
    }
}

struct OptionalObject(Option<ObjectRef>);

impl fmt::Display for OptionalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(object) => write!(f, "{object}"),
            None => f.write_str("null"),
        }
    }
}

/// The short form used in log lines.
impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Thread[{},tid={},{},Thread*={:p},peer={},\"{}\"]",
            self.thin_lock_id(),
            self.tid(),
            self.state(),
            self,
            OptionalObject(self.peer()),
            self.name()
        )
    }
}

fn proc_task_file(tid: i64, name: &str) -> Option<String> {
    fs::read_to_string(format!("/proc/self/task/{tid}/{name}")).ok()
}

/// `(utime, stime, processor)` from the task's stat line.
fn task_stats(tid: i64) -> (u64, u64, u64) {
    let Some(stat) = proc_task_file(tid, "stat") else {
        return (0, 0, 0);
    };
    // The command name may contain spaces; fields resume after its ')'.
    let Some((_, rest)) = stat.rsplit_once(')') else {
        return (0, 0, 0);
    };
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |n: usize| fields.get(n).and_then(|value| value.parse().ok()).unwrap_or(0);
    // Field 3 of stat is the first after the name.
    (field(14 - 3), field(15 - 3), field(39 - 3))
}

/// Name of the task's cpu control group, without the leading slash.
fn scheduler_group_name(tid: i64) -> Option<String> {
    let cgroups = proc_task_file(tid, "cgroup")?;
    cgroups.lines().find_map(|line| {
        let mut parts = line.splitn(3, ':');
        let _hierarchy = parts.next()?;
        let subsystems = parts.next()?;
        let path = parts.next()?;
        let is_cpu = subsystems.split(',').any(|subsystem| subsystem == "cpu") || subsystems.is_empty();
        let name = path.trim_start_matches('/');
        (is_cpu && !name.is_empty()).then(|| name.to_owned())
    })
}

fn os_thread_name(tid: i64) -> String {
    proc_task_file(tid, "comm")
        .map(|name| name.trim_end().to_owned())
        .unwrap_or_else(|| "<unknown>".to_owned())
}

fn clock_ticks() -> i64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    ticks as i64
}

/// `(policy, priority)` of a live pthread.
fn sched_params(handle: usize) -> (i32, i32) {
    let mut policy = 0;
    // SAFETY: sched_param is plain data; the handle belongs to a registered,
    // live thread.
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        if libc::pthread_getschedparam(handle as libc::pthread_t, &mut policy, &mut param) != 0 {
            return (0, 0);
        }
        (policy, param.sched_priority)
    }
}

/// Writes the state block for `thread`, or for an unattached OS thread when
/// `thread` is `None`.
///
/// Counts and state are read without the suspend-count lock so the dump is
/// usable from fatal paths that already hold it.
pub fn dump_state_for(out: &mut dyn fmt::Write, thread: Option<&Thread>, tid: i64) -> fmt::Result {
    let mut group_name = String::new();
    let mut is_daemon = false;
    let mut priority = None;

    let runtime = thread.and_then(|thread| thread.try_runtime().ok());
    if let (Some(thread), Some(runtime)) = (thread, runtime.as_ref()) {
        if let Some(peer) = thread.peer() {
            let objects = runtime.objects();
            priority = objects.get_field(peer, &well_known::THREAD_PRIORITY).as_int();
            is_daemon = objects
                .get_field(peer, &well_known::THREAD_DAEMON)
                .as_bool()
                .unwrap_or(false);
            if let Some(group) = objects.get_field(peer, &well_known::THREAD_GROUP_FIELD).as_object() {
                group_name = objects
                    .get_field(group, &well_known::THREAD_GROUP_NAME)
                    .as_object()
                    .and_then(|name| objects.string_value(name))
                    .unwrap_or_else(|| "<null>".to_owned());
            }
        }
    }
    let priority = priority.unwrap_or_else(|| priority_for_nice(nice_of(tid)));
    let cgroup = scheduler_group_name(tid).unwrap_or_else(|| "default".to_owned());

    match thread {
        Some(thread) => {
            write!(out, "\"{}\"", thread.name())?;
            if is_daemon {
                out.write_str(" daemon")?;
            }
            writeln!(out, " prio={priority} tid={} {}", thread.thin_lock_id(), thread.state())?;
            writeln!(
                out,
                "  | group=\"{group_name}\" sCount={} dsCount={} obj={} self={:p}",
                thread.suspend_count(),
                thread.debug_suspend_count(),
                OptionalObject(thread.peer()),
                thread
            )?;
        }
        None => writeln!(out, "\"{}\" prio={priority} (not attached)", os_thread_name(tid))?,
    }

    write!(out, "  | sysTid={tid} nice={} cgrp={cgroup}", nice_of(tid))?;
    if let Some(thread) = thread {
        let handle = thread.pthread_handle();
        let (policy, sched_priority) = if handle != 0 && thread.state() != ThreadState::Terminated {
            sched_params(handle)
        } else {
            (0, 0)
        };
        write!(out, " sched={policy}/{sched_priority} handle={handle:#x}")?;
    }
    writeln!(out)?;

    let schedstat = proc_task_file(tid, "schedstat")
        .map(|stats| stats.trim_end().to_owned())
        .unwrap_or_else(|| "0 0 0".to_owned());
    let (utime, stime, core) = task_stats(tid);
    writeln!(
        out,
        "  | schedstat=( {schedstat} ) utm={utime} stm={stime} core={core} HZ={}",
        clock_ticks()
    )?;

    if let Some(thread) = thread {
        writeln!(
            out,
            "  | stack={:#x}-{:#x} stackSize={}",
            thread.stack_begin(),
            thread.stack_end(),
            pretty_size(thread.stack_size())
        )?;
    }
    Ok(())
}

fn describe_object(objects: &dyn ObjectModel, object: ObjectRef) -> String {
    let descriptor = objects.class_descriptor(objects.class_of(object));
    format!("<{object}> (a {})", pretty_descriptor(&descriptor))
}

/// Prints managed frames, collapsing runs of identical frames.
struct StackDumpVisitor<'o, 't> {
    out: &'o mut dyn fmt::Write,
    thread: &'t Thread,
    objects: &'t dyn ObjectModel,
    can_allocate: bool,
    last: Option<(Arc<Method>, i32)>,
    occurrences: usize,
    frame_count: usize,
    result: fmt::Result,
}

impl<'o, 't> StackDumpVisitor<'o, 't> {
    fn new(out: &'o mut dyn fmt::Write, thread: &'t Thread, objects: &'t dyn ObjectModel, can_allocate: bool) -> Self {
        Self {
            out,
            thread,
            objects,
            can_allocate,
            last: None,
            occurrences: 0,
            frame_count: 0,
            result: Ok(()),
        }
    }

    fn flush_repetitions(&mut self) -> fmt::Result {
        if self.occurrences > MAX_REPETITION {
            writeln!(self.out, "  ... repeated {} times", self.occurrences - MAX_REPETITION)?;
        }
        Ok(())
    }

    fn print_frame(&mut self, method: &Method, line: i32) -> fmt::Result {
        write!(self.out, "  at {}", method.pretty_name())?;
        if method.is_native() {
            self.out.write_str("(Native method)")?;
        } else {
            let source = method.source_file.as_deref().unwrap_or("unavailable");
            write!(self.out, "({source}:{line})")?;
        }
        writeln!(self.out)?;

        if self.frame_count == 0 {
            self.describe_wait()?;
            if self.can_allocate {
                self.describe_locks()?;
            }
        }
        Ok(())
    }

    fn describe_wait(&mut self) -> fmt::Result {
        match self.thread.state() {
            ThreadState::Waiting | ThreadState::TimedWaiting | ThreadState::Sleeping => {
                // The wait mutex may be held by whoever is aborting.
                let monitor = self.thread.wait.try_lock().and_then(|wait| wait.monitor);
                if let Some(monitor) = monitor {
                    writeln!(self.out, "  - waiting on {}", describe_object(self.objects, monitor))?;
                }
            }
            ThreadState::Blocked => {
                if let Some(object) = self.thread.monitor_enter_object() {
                    write!(self.out, "  - waiting to lock {}", describe_object(self.objects, object))?;
                    match self.objects.monitor_owner(object) {
                        Some(owner) => writeln!(self.out, " held by threadid={owner}")?,
                        None => writeln!(self.out)?,
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn describe_locks(&mut self) -> fmt::Result {
        let Some(monitors) = self.thread.jni_monitors.try_lock() else {
            return Ok(());
        };
        for monitor in monitors.iter() {
            writeln!(self.out, "  - locked {}", describe_object(self.objects, *monitor))?;
        }
        Ok(())
    }

    fn visit(&mut self, frame: &FrameView<'_>) -> fmt::Result {
        let Some(method) = frame.method() else {
            return Ok(());
        };
        if method.is_runtime() {
            return Ok(());
        }
        let line = frame.line_number().unwrap_or(-1);
        let repeated = self
            .last
            .as_ref()
            .is_some_and(|(last_method, last_line)| last_method == method && *last_line == line);
        if repeated {
            self.occurrences += 1;
        } else {
            self.flush_repetitions()?;
            self.last = Some((Arc::clone(method), line));
            self.occurrences = 1;
        }
        if self.occurrences <= MAX_REPETITION {
            self.print_frame(method, line)?;
        }
        self.frame_count += 1;
        Ok(())
    }

    fn finish(mut self) -> fmt::Result {
        self.result?;
        self.flush_repetitions()?;
        if self.frame_count == 0 {
            writeln!(self.out, "  (no managed stack frames)")?;
        }
        Ok(())
    }
}

impl StackVisitor for StackDumpVisitor<'_, '_> {
    fn visit_frame(&mut self, frame: &FrameView<'_>) -> WalkControl {
        self.result = self.visit(frame);
        if self.result.is_ok() {
            WalkControl::Continue
        } else {
            WalkControl::Stop
        }
    }
}

impl Thread {
    pub fn dump_state(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        dump_state_for(out, Some(self), self.tid())
    }

    /// Writes the managed stack, innermost frame first. A thread in native
    /// code gets its native frames first, where they can be obtained.
    pub fn dump_stack(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        if self.state() == ThreadState::Native {
            self.dump_native_stack(out)?;
        }
        let Ok(runtime) = self.try_runtime() else {
            return writeln!(out, "  (runtime unavailable)");
        };
        let Some(stack) = self.managed_stack.try_lock_for(STACK_LOCK_TIMEOUT) else {
            return writeln!(out, "  (managed stack unavailable)");
        };
        let can_allocate = !self.throwing_oom.load(std::sync::atomic::Ordering::Relaxed);
        let mut visitor = StackDumpVisitor::new(out, self, runtime.objects(), can_allocate);
        StackWalker::new(&stack, runtime.code()).walk(&mut visitor);
        visitor.finish()
    }

    fn dump_native_stack(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        if let Some(kernel) = proc_task_file(self.tid(), "stack") {
            for line in kernel.lines() {
                writeln!(out, "  kernel: {line}")?;
            }
        }
        if self.is_current() {
            let backtrace = std::backtrace::Backtrace::force_capture().to_string();
            for line in backtrace.lines() {
                writeln!(out, "  native: {line}")?;
            }
        }
        Ok(())
    }

    /// State block followed by the stack.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.dump_state(out)?;
        self.dump_stack(out)
    }
}
