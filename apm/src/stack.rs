//! Live call-stack capture for the thread profiler.
//!
//! Rust offers no portable way to walk another thread's stack, so threads keep
//! a shadow stack instead: each instrumented scope pushes a [`Frame`] on entry
//! and pops it when its [`ScopeGuard`] drops. A [`ThreadRegistry`] knows every
//! live shadow stack and hands out copies on demand through [`StackSource`].
//!
//! ```ignore
//! apm::stack::register_current_thread(ThreadCategory::Request);
//! let _scope = apm::profile_scope!("handle_request");
//! ```
//!
//! Threads that never registered, or have nothing on their stack, are not
//! reported.

use std::cell::RefCell;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::domain::ThreadCategory;
use crate::sync::lock;

/// Module path prefix of the agent's own code.
const AGENT_MODULE_PREFIX: &str = concat!(env!("CARGO_CRATE_NAME"), "::");

/// One entry on a shadow stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    pub file: &'static str,
    pub function: &'static str,
    /// Line where the scope was opened
    pub first_line: u32,
    /// Line currently executing, updated with [`ScopeGuard::mark_line`]
    pub line: u32,
    pub module: &'static str,
}

impl Frame {
    /// Whether this frame belongs to the agent itself.
    #[must_use]
    pub fn is_agent_code(&self) -> bool {
        self.module == env!("CARGO_CRATE_NAME") || self.module.starts_with(AGENT_MODULE_PREFIX)
    }
}

/// Copy of one thread's stack, outermost frame first.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedStack {
    pub category: ThreadCategory,
    pub frames: Vec<Frame>,
}

/// Enumerates live call stacks at the instant of the call.
pub trait StackSource: Send + Sync {
    /// Whether stacks can be captured at all on this platform/setup.
    fn is_supported(&self) -> bool {
        true
    }

    fn collect(&self) -> Vec<CapturedStack>;
}

#[derive(Debug)]
struct ThreadStack {
    category: Mutex<ThreadCategory>,
    frames: Mutex<Vec<Frame>>,
}

/// Owning handle to a registered shadow stack.
///
/// The registry only holds a weak reference; dropping the last handle
/// unregisters the thread.
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    stack: Arc<ThreadStack>,
}

impl ThreadHandle {
    /// Push `frame`; it is popped when the returned guard drops.
    #[must_use]
    pub fn enter(&self, frame: Frame) -> ScopeGuard {
        lock(&self.stack.frames).push(frame);
        ScopeGuard { stack: Arc::clone(&self.stack) }
    }

    pub fn set_category(&self, category: ThreadCategory) {
        *lock(&self.stack.category) = category;
    }

    #[must_use]
    pub fn category(&self) -> ThreadCategory {
        *lock(&self.stack.category)
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        lock(&self.stack.frames).len()
    }
}

#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct ScopeGuard {
    stack: Arc<ThreadStack>,
}

impl ScopeGuard {
    /// Record the line now executing in this scope.
    pub fn mark_line(&self, line: u32) {
        if let Some(frame) = lock(&self.stack.frames).last_mut() {
            frame.line = line;
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        lock(&self.stack.frames).pop();
    }
}

/// All shadow stacks known to the process (or to a test).
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Weak<ThreadStack>>>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide registry used by [`register_current_thread`] and
    /// [`profile_scope!`](crate::profile_scope).
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ThreadRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(ThreadRegistry::new))
    }

    #[must_use]
    pub fn register(&self, category: ThreadCategory) -> ThreadHandle {
        let stack = Arc::new(ThreadStack {
            category: Mutex::new(category),
            frames: Mutex::new(Vec::new()),
        });
        let mut threads = lock(&self.threads);
        threads.retain(|weak| weak.strong_count() > 0);
        threads.push(Arc::downgrade(&stack));
        ThreadHandle { stack }
    }

    /// Number of registered threads still alive.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        lock(&self.threads).iter().filter(|weak| weak.strong_count() > 0).count()
    }
}

impl StackSource for ThreadRegistry {
    fn collect(&self) -> Vec<CapturedStack> {
        let live: Vec<Arc<ThreadStack>> = {
            let mut threads = lock(&self.threads);
            threads.retain(|weak| weak.strong_count() > 0);
            threads.iter().filter_map(Weak::upgrade).collect()
        };

        live.iter()
            .filter_map(|stack| {
                let frames = lock(&stack.frames).clone();
                if frames.is_empty() {
                    return None;
                }
                Some(CapturedStack { category: *lock(&stack.category), frames })
            })
            .collect()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
}

/// Register the calling thread with the global registry, or recategorize it
/// if already registered.
pub fn register_current_thread(category: ThreadCategory) {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        match current.as_ref() {
            Some(handle) => handle.set_category(category),
            None => *current = Some(ThreadRegistry::global().register(category)),
        }
    });
}

/// Push `frame` on the calling thread's global shadow stack.
///
/// Returns `None` when the thread never registered.
#[must_use]
pub fn enter(frame: Frame) -> Option<ScopeGuard> {
    CURRENT.with(|current| current.borrow().as_ref().map(|handle| handle.enter(frame)))
}

/// Open a profiled scope named `$name` on the current thread.
///
/// Evaluates to an `Option<ScopeGuard>`; keep it alive for the scope's
/// duration.
#[macro_export]
macro_rules! profile_scope {
    ($name:expr) => {
        $crate::stack::enter($crate::stack::Frame {
            file: file!(),
            function: $name,
            first_line: line!(),
            line: line!(),
            module: module_path!(),
        })
    };
}
