//! Reverse-order cleanup for multi-step acquisitions.
//!
//! Each successful step registers how to undo itself. If the acquisition is
//! abandoned (an early `?` return drops the guard) the registered steps run
//! newest first. [`Unwind::commit`] forgets them once every step succeeded.

use tracing::debug;

pub(crate) struct Unwind<'a> {
    steps: Vec<(&'static str, Box<dyn FnOnce() + 'a>)>,
    verbose: bool,
}

impl<'a> Unwind<'a> {
    pub(crate) fn new(verbose: bool) -> Self {
        Self {
            steps: Vec::new(),
            verbose,
        }
    }

    /// Register the undo action for a step that just succeeded.
    pub(crate) fn defer(&mut self, label: &'static str, undo: impl FnOnce() + 'a) {
        self.steps.push((label, Box::new(undo)));
    }

    /// Keep everything acquired so far.
    pub(crate) fn commit(mut self) {
        self.steps.clear();
    }
}

impl Drop for Unwind<'_> {
    fn drop(&mut self) {
        while let Some((label, undo)) = self.steps.pop() {
            if self.verbose {
                debug!("Rolling back: {}", label);
            }
            undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_unwinds_in_reverse_order() {
        let log = RefCell::new(Vec::new());
        {
            let mut unwind = Unwind::new(false);
            unwind.defer("first", || log.borrow_mut().push(1));
            unwind.defer("second", || log.borrow_mut().push(2));
        }
        assert_eq!(*log.borrow(), vec![2, 1]);
    }

    #[test]
    fn test_commit_skips_undo() {
        let log = RefCell::new(Vec::new());
        let mut unwind = Unwind::new(false);
        unwind.defer("first", || log.borrow_mut().push(1));
        unwind.commit();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_early_return_triggers_undo() {
        fn acquire(log: &RefCell<Vec<&'static str>>, fail: bool) -> Result<(), ()> {
            let mut unwind = Unwind::new(true);
            log.borrow_mut().push("open a");
            unwind.defer("close a", || log.borrow_mut().push("undo a"));
            if fail {
                return Err(());
            }
            unwind.commit();
            Ok(())
        }

        let log = RefCell::new(Vec::new());
        assert!(acquire(&log, true).is_err());
        assert_eq!(*log.borrow(), vec!["open a", "undo a"]);

        log.borrow_mut().clear();
        assert!(acquire(&log, false).is_ok());
        assert_eq!(*log.borrow(), vec!["open a"]);
    }
}
