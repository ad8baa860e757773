//! Polygon scanline rasterizer.
//!
//! Feeds hydrology's wet-point copier and the classifier's per-triangle
//! raster sampling: given polygon edges, it yields per-row coverage ranges.
//! Rows must be visited in strictly increasing order; the active edge list
//! is mutated between rows and cannot be rewound.

#[derive(Clone, Copy, Debug)]
struct Edge {
    y0: f64,
    y1: f64,
    x0: f64,
    /// dx per unit dy.
    slope: f64,
}

#[derive(Clone, Copy, Debug)]
struct ActiveEdge {
    cur_x: f64,
    x0: f64,
    y0: f64,
    slope: f64,
    y1: f64,
}

pub struct ScanlineRasterizer {
    edges: Vec<Edge>,
    active: Vec<ActiveEdge>,
    next_edge: usize,
    scan_y: f64,
    range_idx: usize,
    started: bool,
}

impl ScanlineRasterizer {
    pub fn new() -> Self {
        Self {
            edges: Vec::new(),
            active: Vec::new(),
            next_edge: 0,
            scan_y: f64::NEG_INFINITY,
            range_idx: 0,
            started: false,
        }
    }

    /// Register one polygon edge. Horizontal edges contribute nothing and
    /// are dropped; orientation is normalized so y0 < y1.
    pub fn add_edge(&mut self, x1: f64, y1: f64, x2: f64, y2: f64) {
        debug_assert!(!self.started, "edges must be added before scanning");
        if y1 == y2 {
            return;
        }
        let (x_lo, y_lo, x_hi, y_hi) = if y1 < y2 {
            (x1, y1, x2, y2)
        } else {
            (x2, y2, x1, y1)
        };
        self.edges.push(Edge {
            y0: y_lo,
            y1: y_hi,
            x0: x_lo,
            slope: (x_hi - x_lo) / (y_hi - y_lo),
        });
    }

    /// Register a closed ring of points.
    pub fn add_polygon(&mut self, pts: &[(f64, f64)]) {
        for i in 0..pts.len() {
            let (x1, y1) = pts[i];
            let (x2, y2) = pts[(i + 1) % pts.len()];
            self.add_edge(x1, y1, x2, y2);
        }
    }

    /// Begin scanning at row `y`. Must be called once, before the first
    /// `next_range`.
    pub fn start_scanline(&mut self, y: f64) {
        self.edges
            .sort_by(|a, b| a.y0.partial_cmp(&b.y0).unwrap_or(std::cmp::Ordering::Equal));
        self.started = true;
        self.scan_y = y;
        self.recalc_actives();
    }

    /// Move to a later row. Rows must strictly increase.
    pub fn advance_scanline(&mut self, y: f64) {
        debug_assert!(self.started && y > self.scan_y);
        self.scan_y = y;
        self.recalc_actives();
    }

    /// Next in-polygon interval `[x_lo, x_hi)` on the current row, or `None`
    /// when the row is exhausted.
    pub fn next_range(&mut self) -> Option<(f64, f64)> {
        if self.range_idx + 1 < self.active.len() {
            let lo = self.active[self.range_idx].cur_x;
            let hi = self.active[self.range_idx + 1].cur_x;
            self.range_idx += 2;
            Some((lo, hi))
        } else {
            None
        }
    }

    /// True once every edge is behind the current row.
    pub fn done(&self) -> bool {
        self.active.is_empty() && self.next_edge >= self.edges.len()
    }

    fn recalc_actives(&mut self) {
        let y = self.scan_y;
        // Retire finished edges.
        self.active.retain(|e| e.y1 > y);
        // Admit edges whose span now covers the row. Edge list is sorted by
        // y0, so this is a single forward pointer.
        while self.next_edge < self.edges.len() && self.edges[self.next_edge].y0 <= y {
            let e = self.edges[self.next_edge];
            self.next_edge += 1;
            if e.y1 > y {
                self.active.push(ActiveEdge {
                    cur_x: 0.0,
                    x0: e.x0,
                    y0: e.y0,
                    slope: e.slope,
                    y1: e.y1,
                });
            }
        }
        // Exact x at this row, computed from each edge origin so fractional
        // row strides cannot accumulate drift.
        for e in self.active.iter_mut() {
            e.cur_x = e.x0 + e.slope * (y - e.y0);
        }
        self.active
            .sort_by(|a, b| a.cur_x.partial_cmp(&b.cur_x).unwrap_or(std::cmp::Ordering::Equal));
        self.range_idx = 0;
    }
}

impl Default for ScanlineRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience: visit every integer post inside a polygon, south to north.
pub fn for_each_covered_post<F: FnMut(i32, i32)>(pts: &[(f64, f64)], mut f: F) {
    let mut r = ScanlineRasterizer::new();
    r.add_polygon(pts);
    let y_min = pts
        .iter()
        .map(|p| p.1)
        .fold(f64::INFINITY, f64::min)
        .ceil() as i32;
    let y_max = pts
        .iter()
        .map(|p| p.1)
        .fold(f64::NEG_INFINITY, f64::max)
        .floor() as i32;
    if y_min > y_max {
        return;
    }
    r.start_scanline(y_min as f64);
    for y in y_min..=y_max {
        if y > y_min {
            r.advance_scanline(y as f64);
        }
        while let Some((lo, hi)) = r.next_range() {
            let x0 = lo.ceil() as i32;
            let x1 = hi.floor() as i32;
            for x in x0..=x1 {
                if (x as f64) < hi {
                    f(x, y);
                }
            }
        }
    }
}
