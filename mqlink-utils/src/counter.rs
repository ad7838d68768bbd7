use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

type Current = AtomicIsize;
type Max = AtomicIsize;

/// Current value plus the highest value it ever reached.
pub struct Counter(Current, Max);

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Counter(AtomicIsize::new(0), AtomicIsize::new(0))
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    /// Adds `c` and returns the new current value.
    #[inline]
    pub fn incs(&self, c: isize) -> isize {
        let now = self.0.fetch_add(c, Ordering::SeqCst) + c;
        self.1.fetch_max(now, Ordering::SeqCst);
        now
    }

    #[inline]
    pub fn dec(&self) {
        self.decs(1)
    }

    #[inline]
    pub fn decs(&self, c: isize) {
        self.0.fetch_sub(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.1.load(Ordering::SeqCst)
    }
}
