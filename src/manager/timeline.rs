use std::path::PathBuf;

use log::warn;

use crate::{
    context::FarmContext,
    error::Result,
    lock::Lock,
    models::timeline::TimelineEvent,
    persist,
};

/// Appends task events to `timeline.json`, a JSON array shared by every farm
/// working on the same directory. Each append rewrites the whole file, which
/// is fine for one event per task.
pub struct TimelineRecorder {
    path: PathBuf,
    lock: Lock,
}

impl TimelineRecorder {
    pub fn new(ctx: &FarmContext) -> Self {
        TimelineRecorder {
            path: ctx.timeline_path(),
            lock: ctx.lock("timeline.lock"),
        }
    }

    pub fn append(&self, event: TimelineEvent) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let mut events = self.read_events()?;
        events.push(event);
        persist::write_atomic(&self.path, &serde_json::to_vec_pretty(&events)?)
    }

    pub fn events(&self) -> Result<Vec<TimelineEvent>> {
        let _guard = self.lock.acquire()?;
        self.read_events()
    }

    fn read_events(&self) -> Result<Vec<TimelineEvent>> {
        let Some(text) = persist::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&text) {
            Ok(events) => Ok(events),
            Err(e) => {
                warn!("Timeline '{}' is unreadable ({}), starting a new one.", self.path.display(), e);
                Ok(Vec::new())
            }
        }
    }
}
