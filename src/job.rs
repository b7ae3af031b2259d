//! Job descriptors.
//!
//! A job descriptor is an inert value describing one unit of work: what to
//! run, how urgently, how much stack it needs, and which counter tracks its
//! completion. Nothing happens until it is kicked on a
//! [`Scheduler`](crate::scheduler::Scheduler).

use crate::counter::Counter;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling priority. Workers always drain higher priorities first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub const COUNT: usize = 3;
    /// All priorities, most urgent first.
    pub const ALL: [Priority; Priority::COUNT] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Stack-size class a job requires. Selects the fiber pool it is bound to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StackClass {
    #[default]
    Normal,
    Large,
    Gigantic,
    /// Reserved for work that calls into third-party libraries with large,
    /// unpredictable native stack usage (model importers and the like).
    ExternalLibrary,
}

impl StackClass {
    pub const COUNT: usize = 4;
    pub const ALL: [StackClass; StackClass::COUNT] = [
        StackClass::Normal,
        StackClass::Large,
        StackClass::Gigantic,
        StackClass::ExternalLibrary,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Short name used in configuration keys and logs.
    pub fn name(self) -> &'static str {
        match self {
            StackClass::Normal => "normal",
            StackClass::Large => "large",
            StackClass::Gigantic => "gigantic",
            StackClass::ExternalLibrary => "external",
        }
    }
}

/// Which set of workers consumes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Compute-bound jobs run by fiber workers.
    Compute,
    /// Blocking I/O jobs run by dedicated I/O workers.
    Io,
}

impl Lane {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Compute => f.write_str("compute"),
            Lane::Io => f.write_str("io"),
        }
    }
}

/// Maximum number of bytes kept from a debug label.
pub const MAX_LABEL_LEN: usize = 31;

/// A short, fixed-capacity diagnostic label. Longer input is truncated on a
/// character boundary.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugLabel {
    bytes: [u8; MAX_LABEL_LEN],
    len: u8,
}

impl DebugLabel {
    /// Label carried by fibers that have no job bound.
    pub const DETACHED: DebugLabel = DebugLabel::from_static("detached");

    pub fn new(label: &str) -> Self {
        let mut end = label.len().min(MAX_LABEL_LEN);
        while !label.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; MAX_LABEL_LEN];
        bytes[..end].copy_from_slice(&label.as_bytes()[..end]);
        DebugLabel {
            bytes,
            len: end as u8,
        }
    }

    const fn from_static(label: &'static str) -> Self {
        let src = label.as_bytes();
        assert!(src.len() <= MAX_LABEL_LEN);
        let mut bytes = [0u8; MAX_LABEL_LEN];
        let mut i = 0;
        while i < src.len() {
            bytes[i] = src[i];
            i += 1;
        }
        DebugLabel {
            bytes,
            len: src.len() as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        // Only ever built from whole `str` prefixes ending on a char boundary.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for DebugLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for DebugLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque, caller-owned parameter passed to a job's entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamHandle(pub *mut ());

unsafe impl Send for ParamHandle {}
unsafe impl Sync for ParamHandle {}

impl ParamHandle {
    pub fn null() -> Self {
        ParamHandle(std::ptr::null_mut())
    }

    pub fn from_ref<T>(value: &T) -> Self {
        ParamHandle(value as *const T as *mut ())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// Entry point of a job.
pub type EntryPoint = fn(ParamHandle);

pub(crate) enum JobWork {
    Closure(Box<dyn FnOnce() + Send + 'static>),
    Raw {
        entry: EntryPoint,
        params: ParamHandle,
    },
}

impl JobWork {
    /// Lowers the work to the `(entry, params)` pair a fiber is attached with.
    ///
    /// For closures the parameter handle owns the boxed closure; the entry
    /// point takes it back and consumes it.
    pub(crate) fn into_entry(self) -> (EntryPoint, ParamHandle) {
        match self {
            JobWork::Closure(work) => {
                let boxed: Box<Box<dyn FnOnce() + Send + 'static>> = Box::new(work);
                (invoke_closure, ParamHandle(Box::into_raw(boxed).cast()))
            }
            JobWork::Raw { entry, params } => (entry, params),
        }
    }
}

fn invoke_closure(params: ParamHandle) {
    // SAFETY: produced by `JobWork::into_entry`, consumed exactly once.
    let work = unsafe { Box::from_raw(params.0.cast::<Box<dyn FnOnce() + Send + 'static>>()) };
    work();
}

/// Describes one compute-bound job.
///
/// # Example
///
/// ```no_run
/// use fiberjobs::{JobDescr, Priority, StackClass};
///
/// let descr = JobDescr::new(|| println!("hello from a fiber"))
///     .with_priority(Priority::High)
///     .with_stack_class(StackClass::Large)
///     .with_label("greeting");
/// ```
pub struct JobDescr {
    pub(crate) work: JobWork,
    pub(crate) priority: Priority,
    pub(crate) stack_class: StackClass,
    pub(crate) counter: Option<Counter>,
    pub(crate) label: DebugLabel,
}

impl JobDescr {
    /// Creates a descriptor running `work`. The closure's captured state is
    /// the job's parameter and is owned by the job.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_work(JobWork::Closure(Box::new(work)))
    }

    /// Creates a descriptor calling `entry(params)`.
    ///
    /// # Safety
    ///
    /// Whatever `params` points at must stay valid, and be safe to access from
    /// a worker thread, until the job's counter reports completion.
    pub unsafe fn from_raw(entry: EntryPoint, params: ParamHandle) -> Self {
        Self::with_work(JobWork::Raw { entry, params })
    }

    fn with_work(work: JobWork) -> Self {
        JobDescr {
            work,
            priority: Priority::Normal,
            stack_class: StackClass::Normal,
            counter: None,
            label: DebugLabel::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stack_class(mut self, stack_class: StackClass) -> Self {
        self.stack_class = stack_class;
        self
    }

    /// Associates the job with `counter`. The counter's pending count is
    /// incremented when the job is kicked and decremented when it completes.
    pub fn with_counter(mut self, counter: &Counter) -> Self {
        self.counter = Some(counter.clone());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = DebugLabel::new(label);
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn stack_class(&self) -> StackClass {
        self.stack_class
    }

    pub fn counter(&self) -> Option<&Counter> {
        self.counter.as_ref()
    }

    pub fn label(&self) -> DebugLabel {
        self.label
    }
}

impl fmt::Debug for JobDescr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescr")
            .field("priority", &self.priority)
            .field("stack_class", &self.stack_class)
            .field("has_counter", &self.counter.is_some())
            .field("label", &self.label)
            .finish()
    }
}

/// Describes one blocking I/O job. Same shape as [`JobDescr`], but routed to
/// the I/O workers so blocking calls never starve the fiber workers.
#[derive(Debug)]
pub struct IoJobDescr(pub(crate) JobDescr);

impl IoJobDescr {
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        IoJobDescr(JobDescr::new(work))
    }

    /// # Safety
    ///
    /// See [`JobDescr::from_raw`].
    pub unsafe fn from_raw(entry: EntryPoint, params: ParamHandle) -> Self {
        // SAFETY: forwarded caller contract.
        IoJobDescr(unsafe { JobDescr::from_raw(entry, params) })
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        IoJobDescr(self.0.with_priority(priority))
    }

    pub fn with_stack_class(self, stack_class: StackClass) -> Self {
        IoJobDescr(self.0.with_stack_class(stack_class))
    }

    pub fn with_counter(self, counter: &Counter) -> Self {
        IoJobDescr(self.0.with_counter(counter))
    }

    pub fn with_label(self, label: &str) -> Self {
        IoJobDescr(self.0.with_label(label))
    }

    pub fn descr(&self) -> &JobDescr {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_closure_job_runs_through_entry() {
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        let descr = JobDescr::new(move || {
            executed_clone.store(true, Ordering::SeqCst);
        });
        let (entry, params) = descr.work.into_entry();
        assert!(!params.is_null());
        entry(params);

        assert!(executed.load(Ordering::SeqCst));
        // The closure (and its clone of the Arc) was consumed.
        assert_eq!(Arc::strong_count(&executed), 1);
    }

    #[test]
    fn test_raw_job_passes_params() {
        fn bump(params: ParamHandle) {
            let hits = unsafe { &*(params.0 as *const AtomicUsize) };
            hits.fetch_add(1, Ordering::SeqCst);
        }

        let hits = AtomicUsize::new(0);
        let descr = unsafe { JobDescr::from_raw(bump, ParamHandle::from_ref(&hits)) };
        let (entry, params) = descr.work.into_entry();
        entry(params);
        entry(params);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_builder_defaults_and_overrides() {
        let counter = Counter::new(0);
        let descr = JobDescr::new(|| {});
        assert_eq!(descr.priority(), Priority::Normal);
        assert_eq!(descr.stack_class(), StackClass::Normal);
        assert!(descr.counter().is_none());
        assert!(descr.label().is_empty());

        let descr = descr
            .with_priority(Priority::Low)
            .with_stack_class(StackClass::ExternalLibrary)
            .with_counter(&counter)
            .with_label("import");
        assert_eq!(descr.priority(), Priority::Low);
        assert_eq!(descr.stack_class(), StackClass::ExternalLibrary);
        assert!(descr.counter().is_some());
        assert_eq!(descr.label().as_str(), "import");
    }

    #[test]
    fn test_label_truncates_on_char_boundary() {
        let long = "é".repeat(40);
        let label = DebugLabel::new(&long);
        assert!(label.as_str().len() <= MAX_LABEL_LEN);
        assert_eq!(label.as_str().len() % 2, 0);
        assert_eq!(DebugLabel::DETACHED.as_str(), "detached");
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::ALL.map(Priority::index), [0, 1, 2]);
    }
}
