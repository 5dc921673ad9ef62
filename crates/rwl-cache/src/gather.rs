//! A composite completion: fires its finisher once every sub-completion
//! has fired *and* the gather has been activated.
//!
//! Sub-completions may be created until activation; activation marks the
//! set closed. The first error among sub statuses wins and is handed to
//! the finisher.

use crate::{Completion, Status};
use parking_lot::Mutex;
use std::sync::Arc;

struct GatherState {
    subs_remaining: usize,
    activated: bool,
    finished: bool,
    status: Status,
    finisher: Option<Completion>,
}

pub(crate) struct Gather {
    state: Arc<Mutex<GatherState>>,
}

impl Clone for Gather {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl Gather {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GatherState {
                subs_remaining: 0,
                activated: false,
                finished: false,
                status: Ok(()),
                finisher: None,
            })),
        }
    }

    /// Add a sub-completion. Must happen before activation.
    pub(crate) fn sub(&self) -> GatherSub {
        let mut state = self.state.lock();
        debug_assert!(!state.activated, "sub created after activation");
        state.subs_remaining += 1;
        GatherSub {
            state: Arc::clone(&self.state),
        }
    }

    pub(crate) fn set_finisher(&self, finisher: Completion) {
        let mut state = self.state.lock();
        debug_assert!(state.finisher.is_none());
        state.finisher = Some(finisher);
    }

    /// Close the set of sub-completions. If all subs have already fired,
    /// the finisher runs now (on this thread).
    pub(crate) fn activate(&self) {
        let fire = {
            let mut state = self.state.lock();
            debug_assert!(!state.activated);
            state.activated = true;
            take_if_done(&mut state)
        };
        if let Some((finisher, status)) = fire {
            finisher(status);
        }
    }
}

pub(crate) struct GatherSub {
    state: Arc<Mutex<GatherState>>,
}

impl GatherSub {
    /// Fire this sub-completion. The first error reported by any sub
    /// becomes the gather's status.
    pub(crate) fn complete(self, status: Status) {
        let fire = {
            let mut state = self.state.lock();
            debug_assert!(state.subs_remaining > 0);
            state.subs_remaining -= 1;
            if state.status.is_ok() {
                if let Err(err) = status {
                    state.status = Err(err);
                }
            }
            take_if_done(&mut state)
        };
        if let Some((finisher, status)) = fire {
            finisher(status);
        }
    }
}

fn take_if_done(state: &mut GatherState) -> Option<(Completion, Status)> {
    if state.activated && state.subs_remaining == 0 && !state.finished {
        state.finished = true;
        let finisher = state.finisher.take()?;
        return Some((finisher, state.status.clone()));
    }
    None
}
