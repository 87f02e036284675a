//! Stackful coroutine contexts.
//!
//! [`callcc`] captures the current continuation and starts running a function
//! on a freshly allocated stack; [`resume`] transfers control to a suspended
//! continuation. Transfers are symmetric: exactly one context runs at a time
//! on a given physical thread, and the suspended side holds a resumable
//! [`Continuation`].
//!
//! A continuation is not tied to the thread that created it. Resuming one
//! from a different OS thread migrates the logical flow (and its stack) to
//! that thread; this is the mechanism behind thread inversion.

mod stack;
mod switch;

pub use stack::{MmapStackAllocator, StackAllocator, StackDesc};
pub(crate) use switch::Continuation;

use switch::Transfer;

use std::io;
use std::mem::{self, ManuallyDrop};
use std::ptr;

/// Bytes left unused between the control record and the usable stack top,
/// guarding the record against overrun by the context entry sequence.
const CONTROL_GAP: usize = 64;

/// Control record placed at the top of each coroutine stack. Holds what the
/// exit path needs to reclaim the stack it is standing on.
struct StackControl<A: StackAllocator, F> {
    stack: StackDesc,
    allocator: ManuallyDrop<A>,
    main: ManuallyDrop<F>,
}

/// Call with current continuation.
///
/// Allocates a stack from `allocator`, then starts executing `main` on it,
/// passing the continuation of the code immediately following this call.
/// Returns on the first transfer back to the caller: the yielded continuation
/// if the new context suspended, or `None` if it already finished.
///
/// When `main` returns a continuation, the context jumps to it through an
/// on-top action that first destroys the coroutine stack (the allocator moved
/// into the control record reclaims it). A panic escaping `main` hits the
/// `extern "C"` trampoline and aborts the process.
pub(crate) fn callcc<A, F>(allocator: A, main: F) -> io::Result<Option<Continuation>>
where
    A: StackAllocator,
    F: FnOnce(Continuation) -> Continuation,
{
    let stack = allocator.allocate()?;

    unsafe {
        // Place the control record at the top of the region, realigned
        // downward for its type.
        let top = stack.sp as usize;
        let align = mem::align_of::<StackControl<A, F>>();
        let record = (top - mem::size_of::<StackControl<A, F>>()) & !(align - 1);
        let control = record as *mut StackControl<A, F>;
        control.write(StackControl {
            stack,
            allocator: ManuallyDrop::new(allocator),
            main: ManuallyDrop::new(main),
        });

        let usable_top = record - CONTROL_GAP;
        let usable_size = usable_top - (top - stack.size);
        let context = switch::coriolis_make_context(
            usable_top as *mut u8,
            usable_size,
            context_entry::<A, F>,
        );

        let transfer = switch::coriolis_jump_context(context, control.cast());
        Ok(transfer.continuation.into_option())
    }
}

/// Resumes the given continuation, suspending the current context.
///
/// Returns the continuation that later transfers control back here, or
/// `None` when the resuming context destroyed itself on the way out.
pub(crate) fn resume(continuation: Continuation) -> Option<Continuation> {
    let transfer = unsafe { switch::coriolis_jump_context(continuation, ptr::null_mut()) };
    transfer.continuation.into_option()
}

/// First frame on every coroutine stack. Runs the main function, then exits
/// to whatever continuation it returned, destroying this stack underneath.
extern "C" fn context_entry<A, F>(transfer: Transfer) -> !
where
    A: StackAllocator,
    F: FnOnce(Continuation) -> Continuation,
{
    let control = transfer.data.cast::<StackControl<A, F>>();

    let next = unsafe {
        let main = ManuallyDrop::take(&mut (*control).main);
        main(transfer.continuation)
    };

    unsafe {
        switch::coriolis_ontop_context(next, control.cast(), context_exit::<A, F>);
    }
    unreachable!("a destroyed context was resumed");
}

/// On-top action run on the destination stack: reclaims the stack of the
/// context that just finished.
extern "C" fn context_exit<A, F>(transfer: Transfer) -> Transfer
where
    A: StackAllocator,
    F: FnOnce(Continuation) -> Continuation,
{
    unsafe {
        let control = transfer.data.cast::<StackControl<A, F>>();
        let allocator = ManuallyDrop::take(&mut (*control).allocator);
        let stack = (*control).stack;
        allocator.deallocate(stack);
    }
    Transfer {
        continuation: Continuation::null(),
        data: ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn runs_to_completion() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();

        let yielded = callcc(MmapStackAllocator::default(), move |caller| {
            flag.set(true);
            caller
        })
        .unwrap();

        assert!(ran.get());
        assert!(yielded.is_none());
    }

    #[test]
    fn round_trip() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = log.clone();

        let yielded = callcc(MmapStackAllocator::default(), move |caller| {
            inner.borrow_mut().push(1);
            let back = resume(caller).expect("caller resumes us exactly once more");
            inner.borrow_mut().push(3);
            back
        })
        .unwrap()
        .expect("first suspension yields a continuation");

        log.borrow_mut().push(2);
        let done = resume(yielded);
        log.borrow_mut().push(4);

        assert!(done.is_none());
        assert_eq!(*log.borrow(), [1, 2, 3, 4]);
    }

    #[test]
    fn state_survives_suspension() {
        let out = Rc::new(Cell::new(0));
        let inner = out.clone();

        let yielded = callcc(MmapStackAllocator::default(), move |caller| {
            let local = 40;
            let back = resume(caller).unwrap();
            inner.set(local + 2);
            back
        })
        .unwrap()
        .unwrap();

        assert_eq!(out.get(), 0);
        resume(yielded);
        assert_eq!(out.get(), 42);
    }

    #[test]
    fn nested_contexts() {
        let sum = Rc::new(Cell::new(0));
        let outer_sum = sum.clone();

        callcc(MmapStackAllocator::default(), move |caller| {
            let inner_sum = outer_sum.clone();
            callcc(MmapStackAllocator::default(), move |inner_caller| {
                inner_sum.set(inner_sum.get() + 1);
                inner_caller
            })
            .unwrap();
            outer_sum.set(outer_sum.get() + 2);
            caller
        })
        .unwrap();

        assert_eq!(sum.get(), 3);
    }

    /// Allocator wrapper that counts reclamations; the stack must be
    /// destroyed exactly once, by the exit path.
    #[derive(Clone)]
    struct CountingAllocator {
        inner: MmapStackAllocator,
        deallocations: Rc<Cell<usize>>,
    }

    impl StackAllocator for CountingAllocator {
        fn allocate(&self) -> std::io::Result<StackDesc> {
            self.inner.allocate()
        }

        fn deallocate(&self, stack: StackDesc) {
            self.deallocations.set(self.deallocations.get() + 1);
            self.inner.deallocate(stack);
        }
    }

    #[test]
    fn stack_reclaimed_on_exit() {
        let deallocations = Rc::new(Cell::new(0));
        let allocator = CountingAllocator {
            inner: MmapStackAllocator::default(),
            deallocations: deallocations.clone(),
        };

        let yielded = callcc(allocator, |caller| {
            let back = resume(caller).unwrap();
            back
        })
        .unwrap()
        .unwrap();

        assert_eq!(deallocations.get(), 0);
        resume(yielded);
        assert_eq!(deallocations.get(), 1);
    }
}
