//! In-progress provisioning counters.
//!
//! Between the moment a capacity decision is made and the moment the new
//! container shows up in a remote list, the container is invisible to cap
//! checks. The tracker counts those in-flight creations per cloud and
//! template so cap checks can add them back in.
//!
//! Only per-template counts are stored; a cloud's total is always the sum of
//! its templates, and zero counts are pruned so an idle tracker is empty.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dockfleet_id::{CloudName, TemplateName};
use tracing::{error, trace};

type Counts = HashMap<CloudName, HashMap<TemplateName, u32>>;

/// Process-wide counters of nodes currently being created.
#[derive(Debug, Default)]
pub struct CapacityTracker {
    counts: Mutex<Counts>,
}

impl CapacityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one in-flight creation. The count is released when the returned
    /// guard drops.
    pub fn reserve(self: &Arc<Self>, cloud: &CloudName, template: &TemplateName) -> Reservation {
        let mut counts = self.counts();
        let count = counts
            .entry(cloud.clone())
            .or_default()
            .entry(template.clone())
            .or_insert(0);
        *count += 1;
        trace!(cloud = %cloud, template = %template, in_progress = *count, "Reserved capacity");

        Reservation {
            tracker: Arc::clone(self),
            cloud: cloud.clone(),
            template: template.clone(),
        }
    }

    /// In-flight creations for a cloud, or for one template of it.
    pub fn in_progress(&self, cloud: &str, template: Option<&str>) -> u32 {
        let counts = self.counts();
        let Some(templates) = counts.get(cloud) else {
            return 0;
        };
        match template {
            Some(t) => templates.get(t).copied().unwrap_or(0),
            None => templates.values().sum(),
        }
    }

    /// Ordered copy of all non-zero counts.
    pub fn snapshot(&self) -> BTreeMap<CloudName, BTreeMap<TemplateName, u32>> {
        self.counts()
            .iter()
            .map(|(cloud, templates)| {
                (
                    cloud.clone(),
                    templates.iter().map(|(t, n)| (t.clone(), *n)).collect(),
                )
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts().is_empty()
    }

    fn release(&self, cloud: &CloudName, template: &TemplateName) {
        let mut counts = self.counts();
        let Some(templates) = counts.get_mut(cloud) else {
            error!(cloud = %cloud, template = %template, "Released capacity for an unknown cloud");
            return;
        };
        match templates.get_mut(template) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                templates.remove(template);
            }
            None => {
                error!(cloud = %cloud, template = %template, "Released capacity for an unknown template");
            }
        }
        if templates.is_empty() {
            counts.remove(cloud);
        }
        trace!(cloud = %cloud, template = %template, "Released capacity");
    }

    fn counts(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One counted in-flight creation. Dropping it decrements the counter, so
/// the count is released on success, failure and panic alike.
#[derive(Debug)]
#[must_use = "the reservation is released as soon as it is dropped"]
pub struct Reservation {
    tracker: Arc<CapacityTracker>,
    cloud: CloudName,
    template: TemplateName,
}

impl Reservation {
    pub fn cloud(&self) -> &CloudName {
        &self.cloud
    }

    pub fn template(&self) -> &TemplateName {
        &self.template
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.tracker.release(&self.cloud, &self.template);
    }
}
