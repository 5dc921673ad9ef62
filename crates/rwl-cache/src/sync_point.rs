//! Sync points: barriers in the log chain.
//!
//! A sync point cannot persist until every write bearing its generation
//! and the prior sync point have persisted; those are the sub-completions
//! of its gather. The next sync point holds an `earlier` link until this
//! one persists, at which point the link is dropped and the registered
//! `on_persisted` callbacks run.

use crate::gather::Gather;
use crate::{Completion, Status};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

pub(crate) struct SyncPoint {
    pub sync_gen_num: u64,
    /// Gathers completion of all writes in this generation plus the
    /// persistence of the previous sync point. Activated when the sync
    /// point is sealed by the creation of its successor.
    pub prior_log_entries_persisted: Gather,
    pub state: Mutex<SyncPointState>,
}

pub(crate) struct SyncPointState {
    pub final_op_sequence_num: u64,
    /// Status the gather fired with; `Ok` until then.
    pub persisted_status: Status,
    pub persisted: bool,
    pub on_persisted: Vec<Completion>,
    pub earlier: Option<Arc<SyncPoint>>,
    pub later: Weak<SyncPoint>,
    /// Writes dispatched in this generation.
    pub writes: u64,
    pub bytes: u64,
    pub writes_completed: u64,
}

impl SyncPoint {
    pub(crate) fn new(sync_gen_num: u64) -> Self {
        Self {
            sync_gen_num,
            prior_log_entries_persisted: Gather::new(),
            state: Mutex::new(SyncPointState {
                final_op_sequence_num: 0,
                persisted_status: Ok(()),
                persisted: false,
                on_persisted: Vec::new(),
                earlier: None,
                later: Weak::new(),
                writes: 0,
                bytes: 0,
                writes_completed: 0,
            }),
        }
    }
}

impl std::fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncPoint")
            .field("sync_gen_num", &self.sync_gen_num)
            .field("final_op_sequence_num", &state.final_op_sequence_num)
            .field("persisted", &state.persisted)
            .field("writes", &state.writes)
            .field("bytes", &state.bytes)
            .field("writes_completed", &state.writes_completed)
            .finish()
    }
}
