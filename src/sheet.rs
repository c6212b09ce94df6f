//! The owned scalar grid the solver operates on.
//!
//! A sheet stores `x_count * y_count` values contiguously in row-major
//! order (x varies fastest). All bulk operations are expressed as
//! transforms or scans over a rectangle; anything that could be asked to do
//! something inconsistent reports failure with a `bool` and leaves the
//! sheet unchanged.

use std::mem;

use crate::{
    Scalar,
    cast,
    strider::{
        Grid,
        GridMut,
    },
    walker::{
        self,
        Alignment,
        LineWalker,
    },
};

/// Rectangular scalar field, contiguous row-major.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sheet<T = f32> {
    x_count: usize,
    y_count: usize,
    cells: Vec<T>,
}

impl<T> Sheet<T>
where
    T: Scalar,
{
    /// 2^15. Keeps `x_count * y_count` comfortably inside the index type.
    pub const MAX_X_COUNT: usize = 1 << 15;
    pub const MAX_Y_COUNT: usize = 1 << 15;

    pub fn new() -> Self {
        Self {
            x_count: 0,
            y_count: 0,
            cells: Vec::new(),
        }
    }

    fn assert_valid(&self) {
        debug_assert!(self.x_count <= Self::MAX_X_COUNT);
        debug_assert!(self.y_count <= Self::MAX_Y_COUNT);
        debug_assert_eq!(self.x_count == 0, self.y_count == 0);
        debug_assert_eq!(self.cells.len(), self.x_count * self.y_count);
    }

    // -------------------------------------------------------------------
    // Dimensions

    pub fn x_count(&self) -> usize {
        self.x_count
    }

    pub fn y_count(&self) -> usize {
        self.y_count
    }

    pub fn xy_count(&self) -> usize {
        self.x_count * self.y_count
    }

    pub fn is_reset(&self) -> bool {
        self.x_count == 0
    }

    fn x_stride(&self) -> isize {
        1
    }

    fn y_stride(&self) -> isize {
        self.x_count as isize
    }

    // -------------------------------------------------------------------
    // Reset and resize

    /// Releases all storage; the sheet is 0 x 0 afterwards.
    pub fn reset(&mut self) {
        self.x_count = 0;
        self.y_count = 0;
        self.cells = Vec::new();
        self.assert_valid();
    }

    fn set_xy_counts_raw(&mut self, x_count: usize, y_count: usize) -> bool {
        if x_count > Self::MAX_X_COUNT || y_count > Self::MAX_Y_COUNT {
            return false;
        }
        // A zero and a non-zero dimension together is not a sheet.
        if (x_count == 0) != (y_count == 0) {
            return false;
        }

        self.reset();
        if x_count != 0 {
            self.x_count = x_count;
            self.y_count = y_count;
            self.cells = vec![T::zero(); x_count * y_count];
        }
        self.assert_valid();
        true
    }

    /// Atomically replaces the grid with a `x_count * y_count` grid filled
    /// with `fill`.
    pub fn set_xy_counts(&mut self, x_count: usize, y_count: usize, fill: T) -> bool {
        if self.set_xy_counts_raw(x_count, y_count) {
            self.fill_sheet(fill);
            true
        }
        else {
            false
        }
    }

    /// Changes resolution while preserving the existing field, so that the
    /// integral of the field carries over. Zero counts reset the sheet.
    pub fn change_xy_counts(&mut self, x_count: usize, y_count: usize) -> bool {
        if self.is_reset() {
            return self.set_xy_counts(x_count, y_count, T::zero());
        }

        let mut other = Self::new();
        if !other.set_xy_counts_raw(x_count, y_count) {
            return false;
        }
        if !other.is_reset() && !Self::copy_preserve_heights(self, &mut other) {
            return false;
        }

        mem::swap(self, &mut other);
        self.assert_valid();
        true
    }

    /// Copies `src` onto `trg` (which keeps its own resolution), preserving
    /// the area under the field. Rows are fitted with a [`LineWalker`] and
    /// each row pair is resampled the same way along x.
    pub fn copy_preserve_heights(src: &Self, trg: &mut Self) -> bool {
        if src.is_reset() && trg.is_reset() {
            return true;
        }
        if src.is_reset() || trg.is_reset() {
            return false;
        }

        let src_rows = src.range_yx();
        let mut trg_rows = trg.range_yx_mut();

        let mut walker = LineWalker::new(src_rows.count(), trg_rows.count(), Alignment::Lo);
        let mut src_row = 0;
        let mut trg_row = 0;
        let mut src_countdown = src_rows.count();
        let mut trg_countdown = trg_rows.count();
        let mut is_new_trg = true;

        loop {
            let src_line = src_rows.line(src_row);
            let mut trg_line = trg_rows.line_mut(trg_row);

            // A row pair that is only partially overlapped contributes a
            // scaled share, based on how much of the trg row it covers.
            let copied = if walker.is_trg_width_fully_covered() {
                if is_new_trg {
                    walker::copy_preserve_area(src_line, &mut trg_line)
                }
                else {
                    walker::accumulate_preserve_area(src_line, &mut trg_line)
                }
            }
            else {
                let scale = walker.trg_overlap_ratio::<T>();
                if is_new_trg {
                    walker::scaled_copy_preserve_area(scale, src_line, &mut trg_line)
                }
                else {
                    walker::scaled_accumulate_preserve_area(scale, src_line, &mut trg_line)
                }
            };
            if !copied {
                return false;
            }

            let step = walker.inc();
            is_new_trg = step.includes_trg();
            if step.includes_src() {
                src_row += 1;
                src_countdown -= 1;
            }
            if step.includes_trg() {
                trg_row += 1;
                trg_countdown -= 1;
            }
            if src_countdown == 0 || trg_countdown == 0 {
                break;
            }
        }
        debug_assert!(src_countdown == 0 && trg_countdown == 0);
        true
    }

    // -------------------------------------------------------------------
    // Ranges

    /// Rows outermost: iterating yields `y_count` lines whose inner loop
    /// walks x.
    pub fn range_yx(&self) -> Grid<'_, T> {
        unsafe {
            Grid::from_raw_parts(
                self.cells.as_ptr(),
                self.y_count,
                self.y_stride(),
                self.x_count,
                self.x_stride(),
            )
        }
    }

    pub fn range_yx_mut(&mut self) -> GridMut<'_, T> {
        unsafe {
            GridMut::from_raw_parts(
                self.cells.as_mut_ptr(),
                self.y_count,
                self.y_stride(),
                self.x_count,
                self.x_stride(),
            )
        }
    }

    /// Columns outermost: iterating yields `x_count` lines whose inner loop
    /// walks y.
    pub fn range_xy(&self) -> Grid<'_, T> {
        unsafe {
            Grid::from_raw_parts(
                self.cells.as_ptr(),
                self.x_count,
                self.x_stride(),
                self.y_count,
                self.y_stride(),
            )
        }
    }

    pub fn range_xy_mut(&mut self) -> GridMut<'_, T> {
        unsafe {
            GridMut::from_raw_parts(
                self.cells.as_mut_ptr(),
                self.x_count,
                self.x_stride(),
                self.y_count,
                self.y_stride(),
            )
        }
    }

    /// Source and target row views over the same cells, for in-place
    /// passes. The kernels read ahead by value before they write, which is
    /// what makes the aliasing workable.
    pub fn range_yx_in_place(&mut self) -> (Grid<'_, T>, GridMut<'_, T>) {
        let ptr = self.cells.as_mut_ptr();
        let (y_count, y_stride) = (self.y_count, self.y_stride());
        let (x_count, x_stride) = (self.x_count, self.x_stride());
        unsafe {
            (
                Grid::from_raw_parts(ptr, y_count, y_stride, x_count, x_stride),
                GridMut::from_raw_parts(ptr, y_count, y_stride, x_count, x_stride),
            )
        }
    }

    pub fn range_xy_in_place(&mut self) -> (Grid<'_, T>, GridMut<'_, T>) {
        let ptr = self.cells.as_mut_ptr();
        let (y_count, y_stride) = (self.y_count, self.y_stride());
        let (x_count, x_stride) = (self.x_count, self.x_stride());
        unsafe {
            (
                Grid::from_raw_parts(ptr, x_count, x_stride, y_count, y_stride),
                GridMut::from_raw_parts(ptr, x_count, x_stride, y_count, y_stride),
            )
        }
    }

    /// Sub-rectangle, rows outermost. Empty on invalid bounds, which makes
    /// everything downstream a no-op.
    pub fn range_yx_rect(
        &self,
        x_lo: usize,
        x_hi_exclusive: usize,
        y_lo: usize,
        y_hi_exclusive: usize,
    ) -> Grid<'_, T> {
        if self.is_reset() {
            return Grid::empty();
        }
        let mut grid = self.range_yx();
        if grid.restrict_by_index(y_lo, y_hi_exclusive)
            && grid.restrict_inner_by_index(x_lo, x_hi_exclusive)
        {
            grid
        }
        else {
            Grid::empty()
        }
    }

    pub fn range_yx_rect_mut(
        &mut self,
        x_lo: usize,
        x_hi_exclusive: usize,
        y_lo: usize,
        y_hi_exclusive: usize,
    ) -> GridMut<'_, T> {
        if self.is_reset() {
            return GridMut::empty();
        }
        let mut grid = self.range_yx_mut();
        if grid.restrict_by_index(y_lo, y_hi_exclusive)
            && grid.restrict_inner_by_index(x_lo, x_hi_exclusive)
        {
            grid
        }
        else {
            GridMut::empty()
        }
    }

    // -------------------------------------------------------------------
    // Element access

    /// Value at (x, y). Panics when the coordinates are out of range.
    pub fn get_at(&self, x: usize, y: usize) -> T {
        assert!(x < self.x_count && y < self.y_count);
        self.cells[x + y * self.x_count]
    }

    pub fn set_value_at(&mut self, value: T, x: usize, y: usize) -> bool {
        if x < self.x_count && y < self.y_count {
            let x_count = self.x_count;
            self.cells[x + y * x_count] = value;
            true
        }
        else {
            false
        }
    }

    pub fn cells(&self) -> &[T] {
        &self.cells
    }

    // -------------------------------------------------------------------
    // Transforms and scans

    /// Visits every cell of the rectangle once, storing
    /// `calc(old_value, x, y)` through `assign(cell, new_value)`.
    pub fn transform_rectangle_with<F, A>(
        &mut self,
        mut calc: F,
        mut assign: A,
        x_lo: usize,
        x_hi_exclusive: usize,
        y_lo: usize,
        y_hi_exclusive: usize,
    ) -> bool
    where
        F: FnMut(T, usize, usize) -> T,
        A: FnMut(&mut T, T),
    {
        let mut grid = self.range_yx_rect_mut(x_lo, x_hi_exclusive, y_lo, y_hi_exclusive);
        if grid.is_empty() {
            return false;
        }
        for row in 0..grid.count() {
            let y = y_lo + row;
            let mut line = grid.line_mut(row);
            for col in 0..line.count() {
                let x = x_lo + col;
                let new_value = calc(line.get(col), x, y);
                assign(line.at_mut(col), new_value);
            }
        }
        true
    }

    pub fn transform_rectangle<F>(
        &mut self,
        calc: F,
        x_lo: usize,
        x_hi_exclusive: usize,
        y_lo: usize,
        y_hi_exclusive: usize,
    ) -> bool
    where
        F: FnMut(T, usize, usize) -> T,
    {
        self.transform_rectangle_with(
            calc,
            |cell, value| *cell = value,
            x_lo,
            x_hi_exclusive,
            y_lo,
            y_hi_exclusive,
        )
    }

    pub fn transform_sheet<F>(&mut self, calc: F) -> bool
    where
        F: FnMut(T, usize, usize) -> T,
    {
        let (x_count, y_count) = (self.x_count, self.y_count);
        self.transform_rectangle(calc, 0, x_count, 0, y_count)
    }

    /// Read-only rectangle traversal; stops as soon as `scan` returns
    /// false.
    pub fn scan_rectangle<F>(
        &self,
        mut scan: F,
        x_lo: usize,
        x_hi_exclusive: usize,
        y_lo: usize,
        y_hi_exclusive: usize,
    ) where
        F: FnMut(T, usize, usize) -> bool,
    {
        let grid = self.range_yx_rect(x_lo, x_hi_exclusive, y_lo, y_hi_exclusive);
        for (row, line) in grid.lines().enumerate() {
            let y = y_lo + row;
            for (col, value) in line.iter().enumerate() {
                if !scan(value, x_lo + col, y) {
                    return;
                }
            }
        }
    }

    pub fn scan_sheet<F>(&self, scan: F)
    where
        F: FnMut(T, usize, usize) -> bool,
    {
        self.scan_rectangle(scan, 0, self.x_count, 0, self.y_count);
    }

    // -------------------------------------------------------------------
    // Fills and scales

    pub fn fill_sheet(&mut self, value: T) -> bool {
        if self.is_reset() {
            return false;
        }
        self.cells.fill(value);
        true
    }

    pub fn fill_rectangle_coords(
        &mut self,
        value: T,
        x_lo: usize,
        x_hi_exclusive: usize,
        y_lo: usize,
        y_hi_exclusive: usize,
    ) -> bool {
        self.transform_rectangle(
            |_, _, _| value,
            x_lo,
            x_hi_exclusive,
            y_lo,
            y_hi_exclusive,
        )
    }

    pub fn scale_rectangle_coords(
        &mut self,
        scale: T,
        x_lo: usize,
        x_hi_exclusive: usize,
        y_lo: usize,
        y_hi_exclusive: usize,
    ) -> bool {
        self.transform_rectangle(
            |old, _, _| old * scale,
            x_lo,
            x_hi_exclusive,
            y_lo,
            y_hi_exclusive,
        )
    }

    pub fn scale_sheet(&mut self, scale: T) -> bool {
        let (x_count, y_count) = (self.x_count, self.y_count);
        self.scale_rectangle_coords(scale, 0, x_count, 0, y_count)
    }

    // -------------------------------------------------------------------
    // Reductions

    pub fn get_min_max_values_rect(
        &self,
        x_lo: usize,
        x_hi_exclusive: usize,
        y_lo: usize,
        y_hi_exclusive: usize,
    ) -> Option<(T, T)> {
        let mut found: Option<(T, T)> = None;
        self.scan_rectangle(
            |value, _, _| {
                found = Some(match found {
                    None => (value, value),
                    Some((lo, hi)) => (lo.min(value), hi.max(value)),
                });
                true
            },
            x_lo,
            x_hi_exclusive,
            y_lo,
            y_hi_exclusive,
        );
        found
    }

    pub fn get_min_max_values(&self) -> Option<(T, T)> {
        self.get_min_max_values_rect(0, self.x_count, 0, self.y_count)
    }

    pub fn get_min_value(&self) -> Option<T> {
        self.get_min_max_values().map(|(lo, _)| lo)
    }

    // -------------------------------------------------------------------
    // Normalize

    /// Linearly remaps the rectangle so its min and max land on `trg_lo`
    /// and `trg_hi`. A flat rectangle goes to the midpoint. Returns the
    /// trg/src slope on success (zero whenever the result is flat), `None`
    /// on an invalid rectangle.
    pub fn normalize_rectangle_with_ratio(
        &mut self,
        x_lo: usize,
        x_hi_exclusive: usize,
        y_lo: usize,
        y_hi_exclusive: usize,
        trg_lo: T,
        trg_hi: T,
    ) -> Option<T> {
        if trg_lo == trg_hi {
            return self
                .fill_rectangle_coords(trg_lo, x_lo, x_hi_exclusive, y_lo, y_hi_exclusive)
                .then_some(T::zero());
        }

        let (src_lo, src_hi) =
            self.get_min_max_values_rect(x_lo, x_hi_exclusive, y_lo, y_hi_exclusive)?;

        if src_lo < src_hi {
            let ratio = (trg_hi - trg_lo) / (src_hi - src_lo);
            self.transform_rectangle(
                |value, _, _| {
                    if value <= src_lo {
                        trg_lo
                    }
                    else if value >= src_hi {
                        trg_hi
                    }
                    else {
                        (value - src_lo) * ratio + trg_lo
                    }
                },
                x_lo,
                x_hi_exclusive,
                y_lo,
                y_hi_exclusive,
            );
            Some(ratio)
        }
        else {
            // Flat field: spread is impossible, settle on the midpoint.
            let two = T::one() + T::one();
            self.fill_rectangle_coords(
                (trg_lo + trg_hi) / two,
                x_lo,
                x_hi_exclusive,
                y_lo,
                y_hi_exclusive,
            );
            Some(T::zero())
        }
    }

    pub fn normalize_rectangle(
        &mut self,
        x_lo: usize,
        x_hi_exclusive: usize,
        y_lo: usize,
        y_hi_exclusive: usize,
        trg_lo: T,
        trg_hi: T,
    ) -> bool {
        self.normalize_rectangle_with_ratio(
            x_lo,
            x_hi_exclusive,
            y_lo,
            y_hi_exclusive,
            trg_lo,
            trg_hi,
        )
        .is_some()
    }

    pub fn normalize(&mut self, trg_lo: T, trg_hi: T) -> bool {
        let (x_count, y_count) = (self.x_count, self.y_count);
        self.normalize_rectangle(0, x_count, 0, y_count, trg_lo, trg_hi)
    }

    // -------------------------------------------------------------------
    // Point-wise combines

    /// Applies `combine(cell, other_cell)` over matching cells. False when
    /// the shapes differ; neither sheet changes in that case.
    pub fn combine_with<F>(&mut self, mut combine: F, other: &Self) -> bool
    where
        F: FnMut(&mut T, T),
    {
        if self.x_count != other.x_count || self.y_count != other.y_count {
            return false;
        }
        for (cell, value) in self.cells.iter_mut().zip(other.cells.iter()) {
            combine(cell, *value);
        }
        true
    }

    pub fn maybe_add_in(&mut self, other: &Self) -> bool {
        self.combine_with(|cell, value| *cell = *cell + value, other)
    }

    pub fn maybe_subtract_out(&mut self, other: &Self) -> bool {
        self.combine_with(|cell, value| *cell = *cell - value, other)
    }

    // -------------------------------------------------------------------
    // Seed fields

    /// Normal-distribution bump. `center` may land between cells.
    pub fn fill_bell_curve(
        &mut self,
        center_x: T,
        center_y: T,
        std_dev_x: T,
        std_dev_y: T,
        z_lo: T,
        z_hi: T,
    ) -> bool {
        let two = T::one() + T::one();
        let neg2_sq_x = -two * std_dev_x * std_dev_x;
        let neg2_sq_y = -two * std_dev_y * std_dev_y;
        debug_assert!(neg2_sq_x < T::zero() && neg2_sq_y < T::zero());
        let z_delta = z_hi - z_lo;

        self.transform_sheet(|_, x, y| {
            let dx = cast::<T>(x as f64) - center_x;
            let dy = cast::<T>(y as f64) - center_y;
            z_lo + z_delta * ((dx * dx) / neg2_sq_x + (dy * dy) / neg2_sq_y).exp()
        })
    }

    /// sin(r)/r ripple centred on `center`, with `dist` the first zero
    /// crossing along each axis.
    pub fn fill_sin_over_dist(
        &mut self,
        center_x: T,
        center_y: T,
        dist_x: T,
        dist_y: T,
        z_lo: T,
        z_hi: T,
    ) -> bool {
        debug_assert!(dist_x > T::zero() && dist_y > T::zero());
        let pi = cast::<T>(std::f64::consts::PI);
        let pi_over_dist_x = pi / dist_x;
        let pi_over_dist_y = pi / dist_y;
        let two = T::one() + T::one();
        let z_base = z_lo + T::one();
        let z_delta = (z_hi - z_lo) / two;
        let near_zero = cast::<T>(1.0e-4);

        self.transform_sheet(|_, x, y| {
            let dx = (cast::<T>(x as f64) - center_x) * pi_over_dist_x;
            let dy = (cast::<T>(y as f64) - center_y) * pi_over_dist_y;
            let r = (dx * dx + dy * dy).sqrt();
            let sin_over_r = if r < near_zero { T::one() } else { r.sin() / r };
            z_base + z_delta * sin_over_r
        })
    }
}

// _______________________________________________________________________
