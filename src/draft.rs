//! Local draft of an in-progress closing.
//!
//! The working state is shadowed into the scratch store after every change
//! so a reload does not lose typed readings. A draft is only restored for the
//! same business date it was saved on; anything older is discarded.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attendants::AttendantSession;
use crate::store::{ScratchStore, StoreResult};

/// Scratch-store key prefix. The suffix is the location id.
const DRAFT_KEY_PREFIX: &str = "closing_draft_v1_";

pub fn draft_key(location_id: i64) -> String {
    format!("{DRAFT_KEY_PREFIX}{location_id}")
}

/// The two editable cells of one nozzle row, as typed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingCells {
    #[serde(default)]
    pub initial: String,
    #[serde(rename = "final", default)]
    pub final_reading: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSnapshot {
    /// Keyed by nozzle id.
    #[serde(default)]
    pub readings_map: BTreeMap<i64, ReadingCells>,
    pub selected_date: NaiveDate,
    #[serde(default)]
    pub selected_shift_id: Option<i64>,
    #[serde(default)]
    pub attendant_sessions: Vec<AttendantSession>,
}

/// Saves and restores drafts for one location.
///
/// Saving is refused until [`DraftManager::restore`] has run once, so an
/// empty screen cannot overwrite a draft that was about to be restored.
pub struct DraftManager<S: ScratchStore> {
    scratch: S,
    location_id: i64,
    restore_decided: bool,
}

impl<S: ScratchStore> DraftManager<S> {
    pub fn new(scratch: S, location_id: i64) -> Self {
        Self {
            scratch,
            location_id,
            restore_decided: false,
        }
    }

    pub fn location_id(&self) -> i64 {
        self.location_id
    }

    pub fn restore_decided(&self) -> bool {
        self.restore_decided
    }

    pub fn scratch(&self) -> &S {
        &self.scratch
    }

    /// Return the stored draft if it was saved for `active_date`.
    ///
    /// A draft for any other date is deleted. An unreadable draft is deleted
    /// too and treated as absent. A failed read leaves the decision pending,
    /// so saving stays refused.
    pub fn restore(&mut self, active_date: NaiveDate) -> StoreResult<Option<DraftSnapshot>> {
        let key = draft_key(self.location_id);
        let stored = self.scratch.get(&key)?;
        self.restore_decided = true;

        let Some(raw) = stored else {
            return Ok(None);
        };

        let snapshot: DraftSnapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(location_id = self.location_id, error = %e, "Discarding unreadable closing draft");
                self.scratch.remove(&key)?;
                return Ok(None);
            }
        };

        if snapshot.selected_date != active_date {
            info!(
                location_id = self.location_id,
                draft_date = %snapshot.selected_date,
                active_date = %active_date,
                "Discarding stale closing draft"
            );
            self.scratch.remove(&key)?;
            return Ok(None);
        }

        debug!(
            location_id = self.location_id,
            readings = snapshot.readings_map.len(),
            sessions = snapshot.attendant_sessions.len(),
            "Restored closing draft"
        );
        Ok(Some(snapshot))
    }

    /// Overwrite the stored draft. Returns `false` (and writes nothing) while
    /// the restore decision is still pending.
    pub fn save(&self, snapshot: &DraftSnapshot) -> StoreResult<bool> {
        if !self.restore_decided {
            debug!(location_id = self.location_id, "Draft save skipped before restore");
            return Ok(false);
        }
        let json = serde_json::to_string(snapshot)?;
        self.scratch.set(&draft_key(self.location_id), &json)?;
        Ok(true)
    }

    pub fn clear(&self) -> StoreResult<()> {
        self.scratch.remove(&draft_key(self.location_id))
    }
}
