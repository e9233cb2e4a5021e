use lantern_shared::MarkedArea;

/// Markers are append-only; their lifetime ends when the renderer says so.
pub(crate) fn append_marked_area(areas: &mut Vec<MarkedArea>, area: MarkedArea) {
    areas.push(area);
}

/// Returns whether anything was removed; an unknown id is a no-op.
pub(crate) fn remove_marked_area(areas: &mut Vec<MarkedArea>, id: &str) -> bool {
    let before = areas.len();
    areas.retain(|area| area.id != id);
    areas.len() != before
}
