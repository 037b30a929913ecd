//! Edge sanitiser: shuffles boundary samples between an item and its Path
//! neighbours until the edges stabilise, so mis-classified edge samples
//! don't distort merge scoring.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::item::{ItemKind, TimelineItem};
use crate::sample::Sample;
use crate::settings::MODE_SHIFT_SPEED;
use crate::store::Store;

/// Hard ceiling on boundary moves per pair, against pathological streams.
const MAX_EDGE_MOVES: usize = 100;

/// Cleans both of `item`'s edges. Each (self, neighbour) pair is worked on
/// only when the neighbour is a Path, both are live and unlocked, and the
/// pair sits within mergeable distance.
pub(crate) fn sanitise_edges(store: &Store, item: &Arc<TimelineItem>) {
    let neighbours = [store.resolve_previous(item), store.resolve_next(item)];
    for neighbour in neighbours.into_iter().flatten() {
        if item.deleted() || neighbour.deleted() {
            continue;
        }
        if item.merge_locked() || neighbour.merge_locked() {
            continue;
        }
        if !neighbour.is_path() || neighbour.is_data_gap() {
            continue;
        }
        match item.kind() {
            ItemKind::Visit => cleanse_visit_path(store, item, &neighbour),
            ItemKind::Path if !item.is_data_gap() => cleanse_path_path(store, item, &neighbour),
            ItemKind::Path => {}
        }
    }
}

fn within_mergeable_distance(a: &TimelineItem, b: &TimelineItem) -> bool {
    match a.distance_from(b) {
        Some(distance) => distance <= a.maximum_mergeable_distance(b),
        None => false,
    }
}

/// Visit↔Path edge: pull path samples that settled inside the visit, push
/// visit samples that clearly belong to the walk away.
fn cleanse_visit_path(store: &Store, visit: &Arc<TimelineItem>, path: &Arc<TimelineItem>) {
    // (sample, destination) history for oscillation detection.
    let mut moves: Vec<(Uuid, Uuid)> = Vec::new();

    loop {
        if moves.len() >= MAX_EDGE_MOVES {
            break;
        }
        if !within_mergeable_distance(visit, path) {
            break;
        }
        let Some(visit_edge) = visit.edge_sample(path) else {
            break;
        };
        let Some(path_edge) = path.edge_sample(visit) else {
            break;
        };
        let (Some(visit_point), Some(path_point)) = (visit_edge.point(), path_edge.point())
        else {
            break;
        };

        let path_edge_inside = visit.contains_location(path_point, 2.0);
        let visit_edge_inside = visit.contains_location(visit_point, 2.0);
        let next_inside = path
            .second_edge_sample(visit)
            .and_then(|s| s.point())
            .map(|p| visit.contains_location(p, 2.0))
            .unwrap_or(false);

        let chosen: Option<(Arc<Sample>, &Arc<TimelineItem>)> =
            if path_edge_inside && next_inside {
                // The path's edge never really left the visit.
                Some((path_edge.clone(), visit))
            } else if !path_edge_inside && !visit_edge_inside {
                // The visit's edge already walked out the door.
                Some((visit_edge.clone(), path))
            } else if !path_edge_inside
                && visit_edge
                    .activity_type()
                    .map(|t| t.is_moving_type())
                    .unwrap_or(false)
                && visit_edge.activity_type() == path_edge.activity_type()
            {
                Some((visit_edge.clone(), path))
            } else {
                None
            };

        let Some((sample, destination)) = chosen else {
            break;
        };

        let key = (sample.id, destination.id);
        if moves.len() >= 2 && moves[moves.len() - 2] == key {
            // The same sample is ping-ponging; the edge is as clean as it
            // gets.
            break;
        }

        let source = if destination.id == visit.id { path } else { visit };
        if source.sample_count() <= 1 {
            break;
        }

        store.assign_samples(destination, &[sample]);
        moves.push(key);
    }

    if !moves.is_empty() {
        debug!(
            visit = %visit.id,
            path = %path.id,
            moves = moves.len(),
            "cleansed visit/path edge"
        );
    }
}

/// Path↔Path edge: claim the neighbour's facing samples while they match
/// this path's activity type.
fn cleanse_path_path(store: &Store, path: &Arc<TimelineItem>, other: &Arc<TimelineItem>) {
    // Same-type paths are never edge-cleansed; the merge engine will join
    // them whole.
    let my_type = path.moving_activity_type();
    if my_type.is_none() || my_type == other.moving_activity_type() {
        return;
    }

    let mut moved = 0usize;
    while moved < MAX_EDGE_MOVES {
        let Some(my_edge) = path.edge_sample(other) else {
            break;
        };
        let Some(their_edge) = other.edge_sample(path) else {
            break;
        };

        // One edge below and one above the mode-shift speed means a real
        // mode boundary lies between the two paths.
        if let (Some(mine), Some(theirs)) = (my_edge.speed(), their_edge.speed()) {
            if (mine < MODE_SHIFT_SPEED) != (theirs < MODE_SHIFT_SPEED) {
                break;
            }
        }

        if their_edge.activity_type() != path.moving_activity_type() {
            break;
        }
        if other.sample_count() <= 1 {
            break;
        }

        store.assign_samples(path, &[their_edge]);
        moved += 1;
    }

    if moved > 0 {
        debug!(
            path = %path.id,
            other = %other.id,
            moves = moved,
            "cleansed path/path edge"
        );
    }
}
