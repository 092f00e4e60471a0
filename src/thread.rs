// uLark: featherweight sandboxed scripting runtime.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.
//
// The per-evaluation execution context.
//
// A Thread owns everything one evaluation is allowed to consume: the
// allocation and step budgets, the required capability set, the
// cancellation state, the debug call stack, and the host hooks. Every
// other component calls into the thread before doing work, so the
// thread is the single choke point where budget breaches and
// cancellation materialize.
//
// Counters live behind an Arc so that a host observer thread (for
// example a deadline watchdog) can hold a CancelHandle and cancel or
// read counters while the evaluation runs. All cross-thread state is
// atomic; the first accounting call after a cancel observes it.
//
// Failure reporting is deliberately double: a breaching add_* call
// returns the budget error immediately *and* the next control check
// converts the standing breach into a sticky cancellation, so a caller
// that drops the first error cannot keep running.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::caps::SafetyFlags;
use crate::env::Module;
use crate::error::{Error, Result};
use crate::safenum::SafeInt;

const REASON_STEPS: &str = "too many steps";
const REASON_MEMORY: &str = "exceeded memory allocation limits";

// Allocator size-class rounding used when accounting for growable
// backing stores. Multiples of 16 up to 512 bytes, then quarter
// power-of-two steps, which tracks what general-purpose allocators
// actually hand out closely enough for budget purposes.
pub fn round_alloc(bytes: usize) -> usize {
    if bytes == 0 {
        return 0;
    }
    if bytes <= 512 {
        return ((bytes + 15) & !15).max(16);
    }
    let pow = bytes.checked_next_power_of_two().unwrap_or(usize::MAX);
    let quarter = (pow / 4).max(1);
    match bytes.checked_add(quarter - 1) {
        Some(n) => n / quarter * quarter,
        None => usize::MAX,
    }
}

// Budget caps for thread construction, in the shape hosts keep in
// their own config files. None means unlimited.
#[derive(Deserialize, Debug, Copy, Clone, Default)]
pub struct Limits {
    pub max_allocs: Option<u64>,
    pub max_steps: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub name: String,
}

impl Frame {
    pub fn new(name: &str) -> Frame {
        Frame { name: name.to_string() }
    }
}

// Cross-thread shared state. The counters never hold the SafeInt
// invalid sentinel: updates saturate into [0, i64::MAX] instead.
#[derive(Debug)]
struct ThreadState {
    allocs: AtomicI64,
    alloc_cap: AtomicI64,
    steps: AtomicI64,
    step_cap: AtomicI64,
    // Budget base for steps, advanced by uncancel so that a recovered
    // thread measures its budget from the recovery point.
    step_floor: AtomicI64,
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

fn add_saturating(counter: &AtomicI64, delta: i64) -> i64 {
    loop {
        let cur = counter.load(Ordering::SeqCst);
        let new = cur.saturating_add(delta).max(0);
        if counter
            .compare_exchange_weak(cur, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return new;
        }
    }
}

impl ThreadState {
    fn new() -> ThreadState {
        ThreadState {
            allocs: AtomicI64::new(0),
            alloc_cap: AtomicI64::new(i64::MAX),
            steps: AtomicI64::new(0),
            step_cap: AtomicI64::new(i64::MAX),
            step_floor: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    fn cancel(&self, reason: &str) {
        let mut slot = self.reason.lock().unwrap();
        // Sticky: the first reason wins.
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            *slot = Some(reason.to_string());
        }
    }

    fn uncancel(&self) {
        let mut slot = self.reason.lock().unwrap();
        self.cancelled.store(false, Ordering::SeqCst);
        *slot = None;
        self.step_floor
            .store(self.steps.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn cancelled_reason(&self) -> Option<String> {
        if self.cancelled.load(Ordering::SeqCst) {
            Some(self.reason.lock().unwrap().clone().unwrap_or_default())
        } else {
            None
        }
    }

    fn steps_over_cap(&self, steps: i64) -> bool {
        let floor = self.step_floor.load(Ordering::SeqCst);
        steps.saturating_sub(floor) > self.step_cap.load(Ordering::SeqCst)
    }

    // The control check: cancellation first, then standing breaches
    // become cancellation. Every accounting entry point runs this.
    fn control(&self) -> Result<()> {
        if let Some(reason) = self.cancelled_reason() {
            return Err(Error::Cancelled(reason));
        }
        if self.steps_over_cap(self.steps.load(Ordering::SeqCst)) {
            self.cancel(REASON_STEPS);
            return Err(Error::Cancelled(REASON_STEPS.to_string()));
        }
        if self.allocs.load(Ordering::SeqCst) > self.alloc_cap.load(Ordering::SeqCst) {
            self.cancel(REASON_MEMORY);
            return Err(Error::Cancelled(REASON_MEMORY.to_string()));
        }
        Ok(())
    }

    // Record an allocation delta. Positive deltas that cross the cap
    // still record (the running total stays truthful) and return the
    // budget error; negative deltas saturate at zero and never fail.
    fn add_allocs(&self, delta: SafeInt) -> Result<()> {
        self.control()?;
        let delta = delta.get().ok_or(Error::MemoryBudget)?;
        let new = add_saturating(&self.allocs, delta);
        if delta > 0 && new > self.alloc_cap.load(Ordering::SeqCst) {
            return Err(Error::MemoryBudget);
        }
        Ok(())
    }

    // Dry-run variant: same error, nothing recorded.
    fn check_allocs(&self, delta: SafeInt) -> Result<()> {
        self.control()?;
        let delta = delta.get().ok_or(Error::MemoryBudget)?;
        let projected = self
            .allocs
            .load(Ordering::SeqCst)
            .saturating_add(delta)
            .max(0);
        if delta > 0 && projected > self.alloc_cap.load(Ordering::SeqCst) {
            return Err(Error::MemoryBudget);
        }
        Ok(())
    }

    fn add_steps(&self, delta: SafeInt) -> Result<()> {
        self.control()?;
        let delta = delta.get().ok_or(Error::StepBudget)?;
        let new = add_saturating(&self.steps, delta);
        if delta > 0 && self.steps_over_cap(new) {
            return Err(Error::StepBudget);
        }
        Ok(())
    }

    fn check_steps(&self, delta: SafeInt) -> Result<()> {
        self.control()?;
        let delta = delta.get().ok_or(Error::StepBudget)?;
        let projected = self
            .steps
            .load(Ordering::SeqCst)
            .saturating_add(delta)
            .max(0);
        if delta > 0 && self.steps_over_cap(projected) {
            return Err(Error::StepBudget);
        }
        Ok(())
    }
}

// Cloneable handle for host observer threads: cancellation and counter
// traffic only, no access to values, hooks or frames.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    state: Arc<ThreadState>,
}

impl CancelHandle {
    pub fn cancel(&self, reason: &str) {
        self.state.cancel(reason);
    }

    pub fn cancelled(&self) -> Option<String> {
        self.state.cancelled_reason()
    }

    pub fn allocs(&self) -> u64 {
        self.state.allocs.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn steps(&self) -> u64 {
        self.state.steps.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn add_allocs(&self, delta: SafeInt) -> Result<()> {
        self.state.add_allocs(delta)
    }

    pub fn add_steps(&self, delta: SafeInt) -> Result<()> {
        self.state.add_steps(delta)
    }

    pub fn check_allocs(&self, delta: SafeInt) -> Result<()> {
        self.state.check_allocs(delta)
    }

    pub fn check_steps(&self, delta: SafeInt) -> Result<()> {
        self.state.check_steps(delta)
    }
}

pub type PrintHook = Box<dyn FnMut(&str)>;
pub type LoadHook = Box<dyn FnMut(&mut Thread, &str) -> Result<Module>>;

pub struct Thread {
    state: Arc<ThreadState>,
    required: SafetyFlags,
    frames: Rc<RefCell<Vec<Frame>>>,
    print: Option<PrintHook>,
    load: Option<LoadHook>,
}

impl Thread {
    pub fn new() -> Thread {
        Thread {
            state: Arc::new(ThreadState::new()),
            required: SafetyFlags::NOT_SAFE,
            frames: Rc::new(RefCell::new(Vec::new())),
            print: None,
            load: None,
        }
    }

    pub fn with_limits(limits: Limits) -> Thread {
        let thread = Thread::new();
        if let Some(cap) = limits.max_allocs {
            thread.set_alloc_cap(cap);
        }
        if let Some(cap) = limits.max_steps {
            thread.set_step_cap(cap);
        }
        thread
    }

    pub fn set_alloc_cap(&self, cap: u64) {
        let cap = cap.min(i64::MAX as u64) as i64;
        self.state.alloc_cap.store(cap, Ordering::SeqCst);
    }

    pub fn set_step_cap(&self, cap: u64) {
        let cap = cap.min(i64::MAX as u64) as i64;
        self.state.step_cap.store(cap, Ordering::SeqCst);
    }

    pub fn allocs(&self) -> u64 {
        self.state.allocs.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn steps(&self) -> u64 {
        self.state.steps.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn handle(&self) -> CancelHandle {
        CancelHandle { state: self.state.clone() }
    }

    // Required capabilities only grow; there is no relax operation.
    pub fn require(&mut self, caps: SafetyFlags) {
        self.required = self.required.union(caps);
    }

    pub fn required(&self) -> SafetyFlags {
        self.required
    }

    // Whether a provider declaring `caps` may be invoked. An invalid
    // required set surfaces as the error from both forms.
    pub fn permits(&self, caps: SafetyFlags) -> Result<bool> {
        self.state.control()?;
        self.required.validate()?;
        Ok(caps.permits(self.required))
    }

    pub fn check_permits(&self, caps: SafetyFlags) -> Result<()> {
        self.state.control()?;
        self.required.validate()?;
        caps.check(self.required)
    }

    pub fn add_allocs(&self, delta: SafeInt) -> Result<()> {
        self.state.add_allocs(delta)
    }

    pub fn check_allocs(&self, delta: SafeInt) -> Result<()> {
        self.state.check_allocs(delta)
    }

    pub fn add_steps(&self, delta: SafeInt) -> Result<()> {
        self.state.add_steps(delta)
    }

    pub fn check_steps(&self, delta: SafeInt) -> Result<()> {
        self.state.check_steps(delta)
    }

    // Cancellation-and-breach check without any accounting traffic.
    pub fn check_cancelled(&self) -> Result<()> {
        self.state.control()
    }

    pub fn cancel(&self, reason: &str) {
        self.state.cancel(reason);
    }

    // Clears cancellation and measures the step budget from the
    // current count. For hosts recovering from a recoverable cancel;
    // the allocation cap is the host's problem to raise.
    pub fn uncancel(&self) {
        self.state.uncancel();
    }

    pub fn cancelled(&self) -> Option<String> {
        self.state.cancelled_reason()
    }

    // --- debug call stack ---

    pub fn push_frame(&self, frame: Frame) {
        self.frames.borrow_mut().push(frame);
    }

    pub fn pop_frame(&self) -> Option<Frame> {
        self.frames.borrow_mut().pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn frame(&self, i: usize) -> Option<Frame> {
        self.frames.borrow().get(i).cloned()
    }

    // Preallocate at least n frame slots, accounting for the backing
    // store. A negative n is a programming error, not a script error.
    pub fn ensure_stack(&self, n: i64) -> Result<()> {
        assert!(n >= 0, "ensure_stack: negative frame count");
        let n = n as usize;
        let mut frames = self.frames.borrow_mut();
        let cap = frames.capacity();
        if n > cap {
            let grow = (n - cap) * mem::size_of::<Frame>();
            self.state.add_allocs(SafeInt::from(grow))?;
            let len = frames.len();
            frames.reserve_exact(n - len);
        }
        Ok(())
    }

    // Scoped frame push; the pop runs when the guard drops, also on
    // unwind out of a host builtin.
    pub fn frame_guard(&self, name: &str) -> FrameGuard {
        self.frames.borrow_mut().push(Frame::new(name));
        FrameGuard { frames: self.frames.clone() }
    }

    // --- hooks ---

    pub fn set_print_hook(&mut self, hook: impl FnMut(&str) + 'static) {
        self.print = Some(Box::new(hook));
    }

    // Hand rendered print output to the host hook. Returns false when
    // no hook is installed; the caller then owns fallback and refund.
    pub fn emit_print(&mut self, text: &str) -> bool {
        match &mut self.print {
            Some(hook) => {
                hook(text);
                true
            }
            None => false,
        }
    }

    pub fn set_load_hook(
        &mut self,
        hook: impl FnMut(&mut Thread, &str) -> Result<Module> + 'static,
    ) {
        self.load = Some(Box::new(hook));
    }

    // Resolve a module through the host hook. The hook is detached for
    // the duration of the call so it may re-enter the thread.
    pub fn load(&mut self, module: &str) -> Result<Module> {
        self.state.control()?;
        let wrap = |e: Error| Error::Load {
            module: module.to_string(),
            source: Box::new(e),
        };
        let mut hook = match self.load.take() {
            Some(hook) => hook,
            None => {
                return Err(wrap(Error::Operation(
                    "load not implemented by this application".to_string(),
                )))
            }
        };
        let result = hook(self, module);
        self.load = Some(hook);
        result.map_err(wrap)
    }
}

impl Default for Thread {
    fn default() -> Thread {
        Thread::new()
    }
}

pub struct FrameGuard {
    frames: Rc<RefCell<Vec<Frame>>>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.frames.borrow_mut().pop();
    }
}
