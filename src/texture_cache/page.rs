use super::{SourceId, WriteId};
use crate::rect::Rect;
use std::collections::VecDeque;

pub const NUM_PAGE_DRAW_RECTS: usize = 4;

/// One 64x256 tile of VRAM: the sources and pending writes overlapping it,
/// plus the areas recently rendered into.
#[derive(Debug, Clone)]
pub struct PageEntry {
    // texture footprints at the front, palette footprints at the back
    pub(super) sources: VecDeque<SourceId>,
    pub(super) writes: Vec<WriteId>,
    draw_rects: [Rect; NUM_PAGE_DRAW_RECTS],
    num_draw_rects: usize,
    total_draw_rect: Rect,
}

impl Default for PageEntry {
    fn default() -> Self {
        Self {
            sources: VecDeque::new(),
            writes: Vec::new(),
            draw_rects: [Rect::INVALID; NUM_PAGE_DRAW_RECTS],
            num_draw_rects: 0,
            total_draw_rect: Rect::INVALID,
        }
    }
}

impl PageEntry {
    pub fn sources(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.sources.iter().copied()
    }

    pub fn writes(&self) -> &[WriteId] {
        &self.writes
    }

    pub fn draw_rects(&self) -> &[Rect] {
        &self.draw_rects[..self.num_draw_rects]
    }

    pub fn total_draw_rect(&self) -> Rect {
        self.total_draw_rect
    }

    pub fn is_drawn(&self, rect: &Rect) -> bool {
        if self.num_draw_rects == 0 || !self.total_draw_rect.intersects(rect) {
            return false;
        }

        // a single rect is the total
        if self.num_draw_rects == 1 {
            return true;
        }

        self.draw_rects().iter().any(|r| r.intersects(rect))
    }

    /// Records `rc` (already clipped to this page) as drawn. Returns the rect
    /// whose sources must be invalidated, or None if it was already covered.
    pub(super) fn add_draw_rect(&mut self, rc: Rect, clip: &Rect) -> Option<Rect> {
        if self.num_draw_rects == 0 {
            self.draw_rects[0] = rc;
            self.num_draw_rects = 1;
            self.total_draw_rect = rc;
            return Some(rc);
        }

        let mut candidate = self.num_draw_rects;
        for (i, existing) in self.draw_rects().iter().enumerate() {
            if existing.contains(&rc) {
                return None;
            }
            if clip.intersects(existing) {
                // probably the render target of the current draw
                candidate = i;
            }
        }

        if candidate == NUM_PAGE_DRAW_RECTS {
            candidate = self.closest_draw_rect(&rc);
        }

        let invalidated = if candidate != self.num_draw_rects {
            let grown = self.draw_rects[candidate].union(&rc);
            self.draw_rects[candidate] = grown;
            grown
        } else {
            self.draw_rects[candidate] = rc;
            self.num_draw_rects += 1;
            rc
        };

        self.total_draw_rect = self.total_draw_rect.union(&rc);
        Some(invalidated)
    }

    fn closest_draw_rect(&self, rc: &Rect) -> usize {
        let mut closest = 0;
        let mut closest_dist = rc.center_distance_sq(&self.draw_rects[0]);
        for (i, r) in self.draw_rects().iter().enumerate().skip(1) {
            let dist = rc.center_distance_sq(r);
            if dist < closest_dist {
                closest = i;
                closest_dist = dist;
            }
        }
        closest
    }

    /// Drops draw rects touched by a CPU-side write. Returns true if any went.
    pub(super) fn remove_draw_rects_intersecting(&mut self, rect: &Rect) -> bool {
        let before = self.num_draw_rects;
        let mut kept = 0;
        for i in 0..self.num_draw_rects {
            let r = self.draw_rects[i];
            if !r.intersects(rect) {
                self.draw_rects[kept] = r;
                kept += 1;
            }
        }
        self.num_draw_rects = kept;

        if kept == before {
            return false;
        }

        self.total_draw_rect = self
            .draw_rects()
            .iter()
            .fold(Rect::INVALID, |acc, r| acc.union(r));
        true
    }

    pub(super) fn clear_draw_rects(&mut self) {
        self.draw_rects = [Rect::INVALID; NUM_PAGE_DRAW_RECTS];
        self.num_draw_rects = 0;
        self.total_draw_rect = Rect::INVALID;
    }
}
