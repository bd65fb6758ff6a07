// State merger - applies full snapshots and incremental pushes onto a site model
use crate::domain::protocol::StatePatch;
use crate::domain::site::{
    DataGroup, DeviceState, FrequencyDrive, GroupItems, GroupKind, Keyed, ProcessParameter,
    Record, SensorReading, SiteState, ValveState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub replaced: bool,
    pub groups_touched: usize,
    pub departments_changed: bool,
}

/// Where a flat list of the incremental message lands.
#[derive(Debug, Clone, Copy)]
struct Slot {
    id: &'static str,
    kind: GroupKind,
    /// Only a group with this exact id qualifies (the two sensor lists share a kind).
    exact: bool,
}

const INDATA: Slot = Slot { id: "indata", kind: GroupKind::Sensor, exact: true };
const OUTDATA: Slot = Slot { id: "outdata", kind: GroupKind::Sensor, exact: true };
const DEVICES: Slot = Slot { id: "devices", kind: GroupKind::Device, exact: false };
const VALVES: Slot = Slot { id: "valves", kind: GroupKind::Valve, exact: false };
const FREQUENCIES: Slot = Slot { id: "frequencies", kind: GroupKind::Frequency, exact: false };
const PROCESS: Slot = Slot { id: "process", kind: GroupKind::Process, exact: false };
const ENERGY: Slot = Slot { id: "energy", kind: GroupKind::Energy, exact: false };
const RUNTIME: Slot = Slot { id: "runtime", kind: GroupKind::Runtime, exact: false };
const ALARM: Slot = Slot { id: "alarm", kind: GroupKind::Alarm, exact: false };
const LABORATORY: Slot = Slot { id: "laboratory", kind: GroupKind::Laboratory, exact: false };
const HEALTH: Slot = Slot { id: "health", kind: GroupKind::Health, exact: false };
const PRODUCTION: Slot = Slot { id: "production", kind: GroupKind::Production, exact: false };

/// Item types that live in a group's item list.
trait SectionItem: Keyed + Sized {
    fn items_mut(items: &mut GroupItems) -> Option<&mut Vec<Self>>;
}

impl SectionItem for SensorReading {
    fn items_mut(items: &mut GroupItems) -> Option<&mut Vec<Self>> {
        match items {
            GroupItems::Sensors(v) => Some(v),
            _ => None,
        }
    }
}

impl SectionItem for DeviceState {
    fn items_mut(items: &mut GroupItems) -> Option<&mut Vec<Self>> {
        match items {
            GroupItems::Devices(v) => Some(v),
            _ => None,
        }
    }
}

impl SectionItem for ValveState {
    fn items_mut(items: &mut GroupItems) -> Option<&mut Vec<Self>> {
        match items {
            GroupItems::Valves(v) => Some(v),
            _ => None,
        }
    }
}

impl SectionItem for FrequencyDrive {
    fn items_mut(items: &mut GroupItems) -> Option<&mut Vec<Self>> {
        match items {
            GroupItems::Frequencies(v) => Some(v),
            _ => None,
        }
    }
}

impl SectionItem for ProcessParameter {
    fn items_mut(items: &mut GroupItems) -> Option<&mut Vec<Self>> {
        match items {
            GroupItems::Processes(v) => Some(v),
            _ => None,
        }
    }
}

impl SectionItem for Record {
    fn items_mut(items: &mut GroupItems) -> Option<&mut Vec<Self>> {
        match items {
            GroupItems::Records(v) => Some(v),
            _ => None,
        }
    }
}

/// Apply a state message to the site model.
///
/// A snapshot (`dataGroups`) replaces every group; otherwise each present list
/// is merged by item name. Incremental merges never delete or reorder items.
pub fn apply_patch(state: &mut SiteState, patch: StatePatch) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    if let Some(name) = patch.site_name {
        state.name = Some(name);
    }

    if let Some(departments) = patch.departments {
        if departments != state.departments {
            state.departments = departments;
            outcome.departments_changed = true;
        }
    }

    if let Some(groups) = patch.data_groups {
        tracing::debug!(
            "Replacing {} groups of site {} with snapshot of {} groups",
            state.groups.len(),
            state.site_id,
            groups.len()
        );
        outcome.groups_touched = groups.len();
        outcome.replaced = true;
        state.groups = groups;
        return outcome;
    }

    let groups = &mut state.groups;
    let touched = [
        merge_section(groups, INDATA, patch.indata),
        merge_section(groups, OUTDATA, patch.outdata),
        merge_section(groups, DEVICES, patch.devices),
        merge_section(groups, VALVES, patch.valves),
        merge_section(groups, FREQUENCIES, patch.frequencies),
        merge_section(groups, PROCESS, patch.process),
        merge_section(groups, ENERGY, patch.energy),
        merge_section(groups, RUNTIME, patch.runtime),
        merge_section(groups, ALARM, patch.alarm),
        merge_section(groups, LABORATORY, patch.laboratory),
        merge_section(groups, HEALTH, patch.health),
        merge_section(groups, PRODUCTION, patch.production),
    ];
    outcome.groups_touched = touched.iter().filter(|t| **t).count();

    outcome
}

fn qualifies(group: &DataGroup, slot: Slot) -> bool {
    group.kind == slot.kind && (!slot.exact || group.id == slot.id)
}

/// Group that receives items no qualifying group knows yet.
fn home(groups: &mut Vec<DataGroup>, slot: Slot) -> usize {
    let preferred = groups
        .iter()
        .position(|g| g.id == slot.id && g.kind == slot.kind)
        .or_else(|| groups.iter().position(|g| qualifies(g, slot)));

    match preferred {
        Some(index) => index,
        None => {
            groups.push(DataGroup::new(slot.id, slot.id, slot.kind));
            groups.len() - 1
        }
    }
}

/// Merge a flat list across every group of the slot's kind. A site may split
/// one kind over several groups, so each item is matched wherever it lives.
fn merge_section<T: SectionItem>(
    groups: &mut Vec<DataGroup>,
    slot: Slot,
    update: Option<Vec<T>>,
) -> bool {
    let Some(update) = update else {
        return false;
    };

    let mut touched = false;
    for incoming in update {
        let existing = groups
            .iter_mut()
            .filter(|g| qualifies(g, slot))
            .filter_map(|g| T::items_mut(&mut g.items))
            .flat_map(|items| items.iter_mut())
            .find(|item| item.key() == incoming.key());

        match existing {
            Some(item) => {
                item.overlay(incoming);
                touched = true;
            }
            None => {
                let index = home(groups, slot);
                match T::items_mut(&mut groups[index].items) {
                    Some(items) => {
                        items.push(incoming);
                        touched = true;
                    }
                    None => tracing::warn!(
                        "Group {} does not hold {:?} items, skipping {}",
                        groups[index].id,
                        slot.kind,
                        incoming.key()
                    ),
                }
            }
        }
    }

    touched
}
