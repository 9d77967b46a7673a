use std::cell::Cell;
use std::rc::Rc;

/// Cooperative progress reporting and cancellation.
///
/// The engine polls `is_cancelled` between steps; long-running operation
/// bodies should poll it in their own loops. All methods default to no-ops so
/// implementations only override what they observe.
pub trait Monitor {
    fn started(&self, _label: &str, _total_work: f64) {}

    fn progress(&self, _work: f64) {}

    fn message(&self, _msg: &str) {}

    fn done(&self) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Monitor that observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl Monitor for NullMonitor {}

impl NullMonitor {
    pub fn shared() -> Rc<dyn Monitor> {
        Rc::new(NullMonitor)
    }
}

/// Monitor that maps a child activity onto an allotted share of its parent's
/// work. Starting and finishing the child never restarts the parent; progress
/// is scaled so the child contributes exactly `allotted_work` parent units.
pub struct ChildMonitor {
    parent: Rc<dyn Monitor>,
    allotted_work: f64,
    total_work: Cell<Option<f64>>,
    consumed: Cell<f64>,
}

impl ChildMonitor {
    pub fn new(parent: Rc<dyn Monitor>, allotted_work: f64) -> Self {
        Self {
            parent,
            allotted_work,
            total_work: Cell::new(None),
            consumed: Cell::new(0.0),
        }
    }

    pub fn shared(parent: Rc<dyn Monitor>, allotted_work: f64) -> Rc<dyn Monitor> {
        Rc::new(Self::new(parent, allotted_work))
    }
}

impl Monitor for ChildMonitor {
    fn started(&self, _label: &str, total_work: f64) {
        if total_work > 0.0 {
            self.total_work.set(Some(total_work));
        }
    }

    fn progress(&self, work: f64) {
        let scaled = match self.total_work.get() {
            Some(total) => work / total * self.allotted_work,
            None => 0.0,
        };
        self.consumed.set(self.consumed.get() + scaled);
        if scaled > 0.0 {
            self.parent.progress(scaled);
        }
    }

    fn message(&self, msg: &str) {
        self.parent.message(msg);
    }

    fn done(&self) {
        // Hand any unreported remainder to the parent so the allotted share
        // is fully consumed even if the child under-reported.
        let remainder = self.allotted_work - self.consumed.get();
        if remainder > 0.0 {
            self.parent.progress(remainder);
            self.consumed.set(self.allotted_work);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.parent.is_cancelled()
    }
}
