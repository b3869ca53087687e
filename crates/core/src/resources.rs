use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use ndarray::{Array2, Array3, ArrayView3, Axis};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Overlap, in elements, between adjacent tiles of a tiled execution.
const TILE_OVERLAP: usize = 16;

#[derive(Debug, Clone)]
struct ResidentEntry {
    size_bytes: u64,
    last_used: u64,
    inserted: u64,
    pins: HashSet<String>,
}

#[derive(Debug, Default)]
struct ResidencyState {
    resident: HashMap<String, ResidentEntry>,
    clock: u64,
}

impl ResidencyState {
    fn total_bytes(&self) -> u64 {
        self.resident.values().map(|e| e.size_bytes).sum()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Tracks which model/adapter weights are resident against a fixed memory
/// ceiling. All mutation goes through this type; eviction is strict LRU
/// over non-pinned entries, ties broken by insertion order.
pub struct ResourceManager {
    budget_bytes: u64,
    state: Mutex<ResidencyState>,
}

impl ResourceManager {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            state: Mutex::new(ResidencyState::default()),
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Make every entry of `needed` resident, evicting least-recently-used
    /// non-pinned entries as required. Entries are pinned for `pin_owner`
    /// (if given) so a mid-job eviction cannot take them.
    ///
    /// Fails with `BudgetExceeded` when the needed set cannot fit even
    /// after evicting everything evictable; the resident set is left
    /// untouched in that case.
    pub fn ensure_resident(
        &self,
        needed: &[(String, u64)],
        pin_owner: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        let needed_total: u64 = needed.iter().map(|(_, size)| size).sum();
        if needed_total > self.budget_bytes {
            return Err(EngineError::BudgetExceeded {
                needed_bytes: needed_total,
                budget_bytes: self.budget_bytes,
            });
        }

        let needed_ids: HashSet<&str> = needed.iter().map(|(id, _)| id.as_str()).collect();
        let deficit: u64 = needed
            .iter()
            .filter(|(id, _)| !state.resident.contains_key(id))
            .map(|(_, size)| size)
            .sum();

        // Immovable bytes: everything pinned or about to be needed.
        let immovable: u64 = state
            .resident
            .iter()
            .filter(|(id, entry)| needed_ids.contains(id.as_str()) || !entry.pins.is_empty())
            .map(|(_, entry)| entry.size_bytes)
            .sum();
        if immovable + deficit > self.budget_bytes {
            return Err(EngineError::BudgetExceeded {
                needed_bytes: immovable + deficit,
                budget_bytes: self.budget_bytes,
            });
        }

        // Evict until the deficit fits.
        while state.total_bytes() + deficit > self.budget_bytes {
            let victim = state
                .resident
                .iter()
                .filter(|(id, entry)| {
                    entry.pins.is_empty() && !needed_ids.contains(id.as_str())
                })
                .min_by_key(|(_, entry)| (entry.last_used, entry.inserted))
                .map(|(id, _)| id.clone());

            match victim {
                Some(id) => {
                    let evicted = state.resident.remove(&id);
                    debug!(
                        id = %id,
                        size_bytes = evicted.map(|e| e.size_bytes).unwrap_or(0),
                        "Evicted weights to satisfy residency request"
                    );
                }
                // Unreachable given the immovable check above, but never
                // loop on an unexpected state.
                None => {
                    return Err(EngineError::BudgetExceeded {
                        needed_bytes: state.total_bytes() + deficit,
                        budget_bytes: self.budget_bytes,
                    });
                }
            }
        }

        // Touch existing entries and load the remainder.
        for (id, size) in needed {
            let now = state.tick();
            match state.resident.get_mut(id) {
                Some(entry) => {
                    entry.last_used = now;
                    if let Some(owner) = pin_owner {
                        entry.pins.insert(owner.to_string());
                    }
                }
                None => {
                    let mut pins = HashSet::new();
                    if let Some(owner) = pin_owner {
                        pins.insert(owner.to_string());
                    }
                    state.resident.insert(
                        id.clone(),
                        ResidentEntry {
                            size_bytes: *size,
                            last_used: now,
                            inserted: now,
                            pins,
                        },
                    );
                    debug!(id = %id, size_bytes = size, "Loaded weights into resident set");
                }
            }
        }

        debug_assert!(state.total_bytes() <= self.budget_bytes);
        Ok(needed.iter().map(|(id, _)| id.clone()).collect())
    }

    /// Drop all pins held by `owner`. Entries stay resident (warm cache)
    /// but become evictable again. Restores the pre-job pin baseline after
    /// a job finishes, fails, or is cancelled.
    pub fn release_pins(&self, owner: &str) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        for entry in state.resident.values_mut() {
            entry.pins.remove(owner);
        }
    }

    /// Evict everything except the given ids.
    pub fn release_all_except(&self, keep: &[String]) {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.resident.retain(|id, _| keep.contains(id.as_str()));
    }

    pub fn is_resident(&self, id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.resident.contains_key(id)
    }

    pub fn resident_total_bytes(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.total_bytes()
    }

    /// Resident ids ordered least-recently-used first.
    pub fn resident_ids_lru_order(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<(&String, &ResidentEntry)> = state.resident.iter().collect();
        ids.sort_by_key(|(_, entry)| (entry.last_used, entry.inserted));
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

/// Run a shape-preserving operation over a (C, H, W) tensor in spatial
/// tiles bounded by `max_tile_size`, recombining with linear edge
/// blending. Bounds the operation's working set; the one-time peak of a
/// whole-tensor call is what the steady-state residency check cannot see.
pub fn tiled_execute<F>(
    op: F,
    input: &Array3<f32>,
    max_tile_size: usize,
) -> anyhow::Result<Array3<f32>>
where
    F: Fn(ArrayView3<'_, f32>) -> anyhow::Result<Array3<f32>>,
{
    let (_, height, width) = input.dim();

    if max_tile_size == 0 || (height <= max_tile_size && width <= max_tile_size) {
        let out = op(input.view())?;
        anyhow::ensure!(
            out.dim() == input.dim(),
            "tiled operation must preserve shape: {:?} -> {:?}",
            input.dim(),
            out.dim()
        );
        return Ok(out);
    }

    let mut accum = Array3::<f32>::zeros(input.dim());
    let mut weight_sum = Array2::<f32>::zeros((height, width));

    for (y0, y1) in tile_ranges(height, max_tile_size) {
        for (x0, x1) in tile_ranges(width, max_tile_size) {
            let tile = input.slice(ndarray::s![.., y0..y1, x0..x1]);
            let out = op(tile)?;
            anyhow::ensure!(
                out.dim() == tile.dim(),
                "tiled operation must preserve tile shape: {:?} -> {:?}",
                tile.dim(),
                out.dim()
            );

            let wy = edge_ramp(y1 - y0, y0 > 0, y1 < height);
            let wx = edge_ramp(x1 - x0, x0 > 0, x1 < width);

            for (ty, weight_y) in wy.iter().enumerate() {
                for (tx, weight_x) in wx.iter().enumerate() {
                    let weight = weight_y * weight_x;
                    weight_sum[[y0 + ty, x0 + tx]] += weight;
                    for c in 0..accum.len_of(Axis(0)) {
                        accum[[c, y0 + ty, x0 + tx]] += weight * out[[c, ty, tx]];
                    }
                }
            }
        }
    }

    for c in 0..accum.len_of(Axis(0)) {
        for y in 0..height {
            for x in 0..width {
                accum[[c, y, x]] /= weight_sum[[y, x]];
            }
        }
    }

    Ok(accum)
}

/// Tile start/end ranges covering `len`, stepping by tile size minus
/// overlap so adjacent tiles share a blend region.
fn tile_ranges(len: usize, max_tile: usize) -> Vec<(usize, usize)> {
    if len <= max_tile {
        return vec![(0, len)];
    }

    let stride = max_tile.saturating_sub(TILE_OVERLAP).max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + max_tile).min(len);
        ranges.push((start, end));
        if end == len {
            break;
        }
        start += stride;
        if start + max_tile >= len {
            // Final tile is anchored to the end so it never shrinks below
            // the overlap.
            ranges.push((len - max_tile, len));
            break;
        }
    }
    ranges
}

/// Per-position blend weight across one tile axis: linear ramp over the
/// overlap at edges that touch a neighboring tile, flat 1.0 elsewhere.
fn edge_ramp(len: usize, ramp_start: bool, ramp_end: bool) -> Vec<f32> {
    let ramp = TILE_OVERLAP.min(len);
    (0..len)
        .map(|i| {
            let mut w = 1.0f32;
            if ramp_start && i < ramp {
                w = w.min((i + 1) as f32 / (ramp + 1) as f32);
            }
            if ramp_end && i >= len - ramp {
                w = w.min((len - i) as f32 / (ramp + 1) as f32);
            }
            w
        })
        .collect()
}
