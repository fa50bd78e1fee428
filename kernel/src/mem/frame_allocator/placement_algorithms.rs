//! Policies for choosing which free frames to hand out.

use super::CoreMapEntry;
use core::ops::Range;

pub trait PlacementAlgorithm: Send {
    /// Picks `frames_requested` contiguous free frames, returning their
    /// indices in the core map, or [`None`] if no run is long enough.
    fn place(&mut self, core_map: &[CoreMapEntry], frames_requested: usize)
        -> Option<Range<usize>>;
}

/// Length of the run of free frames starting at `start`, counting at most
/// `limit` frames.
fn free_run(core_map: &[CoreMapEntry], start: usize, limit: usize) -> usize {
    core_map[start..]
        .iter()
        .take(limit)
        .take_while(|entry| !entry.allocated())
        .count()
}

/// Resumes searching where the previous allocation ended, wrapping around
/// once.
#[derive(Default)]
pub struct NextFit {
    position: usize,
}

/// Takes the lowest run that fits.
#[derive(Default)]
pub struct FirstFit;

/// Takes the smallest run that fits.
#[derive(Default)]
pub struct BestFit;

fn first_fit_in(
    core_map: &[CoreMapEntry],
    frames_requested: usize,
    search: Range<usize>,
) -> Option<Range<usize>> {
    let mut start = search.start;
    while start + frames_requested <= search.end {
        let run = free_run(core_map, start, frames_requested);
        if run == frames_requested {
            return Some(start..start + run);
        }
        start += run + 1;
    }
    None
}

impl PlacementAlgorithm for NextFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Option<Range<usize>> {
        if frames_requested == 0 || core_map.is_empty() {
            return None;
        }
        let position = self.position.min(core_map.len());
        // A run starting before `position` may extend past it, hence the
        // second search covers the whole map up to where the first began.
        let range = first_fit_in(core_map, frames_requested, position..core_map.len())
            .or_else(|| {
                first_fit_in(
                    core_map,
                    frames_requested,
                    0..(position + frames_requested - 1).min(core_map.len()),
                )
            })?;
        self.position = range.end % core_map.len();
        Some(range)
    }
}

impl PlacementAlgorithm for FirstFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Option<Range<usize>> {
        if frames_requested == 0 {
            return None;
        }
        first_fit_in(core_map, frames_requested, 0..core_map.len())
    }
}

impl PlacementAlgorithm for BestFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Option<Range<usize>> {
        if frames_requested == 0 {
            return None;
        }
        let mut best: Option<(usize, usize)> = None;
        let mut start = 0;
        while start < core_map.len() {
            let run = free_run(core_map, start, usize::MAX);
            if run == frames_requested {
                return Some(start..start + run);
            }
            if run > frames_requested && best.is_none_or(|(_, len)| run < len) {
                best = Some((start, run));
            }
            start += run + 1;
        }
        best.map(|(start, _)| start..start + frames_requested)
    }
}
