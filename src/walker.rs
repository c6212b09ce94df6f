//! Resolution-changing line copies.
//!
//! [`LineWalker`] sits between a source line and a target line of different
//! counts and walks both in lock step, tracking how much of the current
//! source cell overlaps the current target cell. The overlap drives two
//! value maps: *preserve sum* (the sums of the two lines end up equal) and
//! *preserve area* (the integrals end up equal, which is what a resize of a
//! height field wants).

use crate::{
    Scalar,
    cast,
    strider::{
        Line,
        LineMut,
    },
};

/// Which end of the walk the modulo is aligned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alignment {
    Lo,
    Mid,
    Hi,
}

/// Which cursor(s) a [`LineWalker::inc`] step moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Src,
    Trg,
    Both,
}

impl Step {
    pub fn includes_src(self) -> bool {
        matches!(self, Step::Src | Step::Both)
    }

    pub fn includes_trg(self) -> bool {
        matches!(self, Step::Trg | Step::Both)
    }
}

/// Overlap bookkeeping between two lines of different counts.
///
/// Widths are exchanged counts: when the target has 5 cells and the source
/// 10, each source cell is half a target cell wide, so the source width is
/// the *target* count and vice versa. Widths only ever appear in ratios.
#[derive(Clone, Debug)]
pub struct LineWalker {
    src_count: usize,
    trg_count: usize,
    dec_pivot: isize,
    inc_pivot: isize,
    modulo: isize,
}

impl LineWalker {
    pub fn new(src_count: usize, trg_count: usize, alignment: Alignment) -> Self {
        debug_assert!(src_count > 0 && trg_count > 0);
        debug_assert!(src_count.checked_add(trg_count).is_some());

        let dec_pivot = Self::calc_dec_pivot(src_count, trg_count);
        let inc_pivot = Self::calc_inc_pivot(src_count, trg_count);
        let mut walker = Self {
            src_count,
            trg_count,
            dec_pivot,
            inc_pivot,
            modulo: 0,
        };
        walker.set_aligned(alignment);

        debug_assert_eq!(
            walker.dec_pivot + trg_count as isize,
            walker.inc_pivot + src_count as isize
        );
        walker
    }

    fn calc_dec_pivot(src_count: usize, trg_count: usize) -> isize {
        let src_max = (src_count / 2) as isize;
        let src_llimit = src_max - src_count as isize;
        let trg_max = (trg_count / 2) as isize;
        let trg_llimit = trg_max - trg_count as isize;
        trg_llimit - src_llimit
    }

    fn calc_inc_pivot(src_count: usize, trg_count: usize) -> isize {
        (trg_count / 2) as isize - (src_count / 2) as isize
    }

    // -------------------------------------------------------------------
    // Counts and widths

    pub fn src_count(&self) -> usize {
        self.src_count
    }

    pub fn trg_count(&self) -> usize {
        self.trg_count
    }

    pub fn src_width(&self) -> usize {
        self.trg_count
    }

    pub fn trg_width(&self) -> usize {
        self.src_count
    }

    // -------------------------------------------------------------------
    // Alignment

    pub fn is_aligned(&self, alignment: Alignment) -> bool {
        self.modulo == self.modulo_for_alignment(alignment)
    }

    pub fn set_aligned(&mut self, alignment: Alignment) {
        self.modulo = self.modulo_for_alignment(alignment);
    }

    fn modulo_for_alignment(&self, alignment: Alignment) -> isize {
        match alignment {
            Alignment::Lo => self.dec_pivot,
            Alignment::Hi => self.inc_pivot,
            Alignment::Mid => 0,
        }
    }

    // -------------------------------------------------------------------
    // Spill queries

    fn is_trg_spilling_lo(&self) -> bool {
        self.dec_pivot > self.modulo
    }

    fn is_trg_spilling_hi(&self) -> bool {
        self.modulo > self.inc_pivot
    }

    fn trg_lo_spill(&self) -> usize {
        (self.dec_pivot - self.modulo).max(0) as usize
    }

    fn trg_hi_spill(&self) -> usize {
        (self.modulo - self.inc_pivot).max(0) as usize
    }

    fn is_src_spilling_lo(&self) -> bool {
        self.modulo > self.dec_pivot
    }

    fn is_src_spilling_hi(&self) -> bool {
        self.inc_pivot > self.modulo
    }

    fn src_lo_spill(&self) -> usize {
        (self.modulo - self.dec_pivot).max(0) as usize
    }

    fn src_hi_spill(&self) -> usize {
        (self.inc_pivot - self.modulo).max(0) as usize
    }

    pub fn is_src_width_fully_covered(&self) -> bool {
        !self.is_src_spilling_lo() && !self.is_src_spilling_hi()
    }

    pub fn is_trg_width_fully_covered(&self) -> bool {
        !self.is_trg_spilling_lo() && !self.is_trg_spilling_hi()
    }

    /// Width of the overlap between the current src and trg cells.
    pub fn overlap_width(&self) -> usize {
        let from_src = self.src_width() - (self.src_lo_spill() + self.src_hi_spill());
        debug_assert_eq!(
            from_src,
            self.trg_width() - (self.trg_lo_spill() + self.trg_hi_spill())
        );
        debug_assert!(from_src > 0);
        from_src
    }

    pub fn src_overlap_ratio<T>(&self) -> T
    where
        T: Scalar,
    {
        cast::<T>(self.overlap_width() as f64) / cast::<T>(self.src_width() as f64)
    }

    pub fn trg_overlap_ratio<T>(&self) -> T
    where
        T: Scalar,
    {
        cast::<T>(self.overlap_width() as f64) / cast::<T>(self.trg_width() as f64)
    }

    // -------------------------------------------------------------------
    // Stepping

    /// Moves whichever cursor's cell ends first, or both when the cell
    /// boundaries coincide.
    pub fn inc(&mut self) -> Step {
        if self.modulo < self.inc_pivot {
            self.modulo += self.trg_width() as isize;
            Step::Trg
        }
        else if self.modulo > self.inc_pivot {
            self.modulo -= self.src_width() as isize;
            Step::Src
        }
        else {
            self.modulo = self.dec_pivot;
            Step::Both
        }
    }

    pub fn dec(&mut self) -> Step {
        if self.modulo > self.dec_pivot {
            self.modulo -= self.trg_width() as isize;
            Step::Trg
        }
        else if self.modulo < self.dec_pivot {
            self.modulo += self.src_width() as isize;
            Step::Src
        }
        else {
            self.modulo = self.inc_pivot;
            Step::Both
        }
    }

    // -------------------------------------------------------------------
    // Value maps

    /// Maps a source value so the sum over the trg line matches the sum
    /// over the src line.
    pub fn trg_value_preserve_sum<T>(&self, src_value: T) -> T
    where
        T: Scalar,
    {
        if self.is_src_width_fully_covered() {
            src_value
        }
        else {
            src_value * self.src_overlap_ratio::<T>()
        }
    }

    /// Maps a source value so the integral (value times cell width) over
    /// the trg line matches the src line.
    pub fn trg_value_preserve_area<T>(&self, src_value: T) -> T
    where
        T: Scalar,
    {
        if self.is_trg_width_fully_covered() {
            src_value
        }
        else {
            src_value * self.trg_overlap_ratio::<T>()
        }
    }
}

// _______________________________________________________________________
// Copy/accumulate entry points

#[derive(Clone, Copy, Debug)]
enum Preserve {
    Sum,
    Area,
}

#[derive(Clone, Copy, Debug)]
enum Combine {
    Copy,
    Accumulate,
}

fn resample<T>(
    preserve: Preserve,
    combine: Combine,
    scale: Option<T>,
    src: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
) -> bool
where
    T: Scalar,
{
    let src_count = src.count();
    let trg_count = trg.count();

    let scaled = |value: T| scale.map_or(value, |factor| value * factor);

    // Equal counts degrade to an element-wise pass.
    if src_count == trg_count {
        for index in 0..src_count {
            let value = scaled(src.get(index));
            match combine {
                Combine::Copy => trg.set(index, value),
                Combine::Accumulate => trg.set(index, trg.get(index) + value),
            }
        }
        return true;
    }

    if src_count == 0 || trg_count == 0 {
        return false;
    }

    let mut walker = LineWalker::new(src_count, trg_count, Alignment::Lo);
    let mut src_index = 0;
    let mut trg_index = 0;
    let mut src_countdown = src_count;
    let mut trg_countdown = trg_count;
    let mut is_new_trg = true;

    loop {
        let value = match preserve {
            Preserve::Sum => walker.trg_value_preserve_sum(scaled(src.get(src_index))),
            Preserve::Area => walker.trg_value_preserve_area(scaled(src.get(src_index))),
        };
        match combine {
            Combine::Copy if is_new_trg => trg.set(trg_index, value),
            _ => trg.set(trg_index, trg.get(trg_index) + value),
        }

        let step = walker.inc();
        is_new_trg = step.includes_trg();
        if step.includes_src() {
            src_index += 1;
            src_countdown -= 1;
        }
        if step.includes_trg() {
            trg_index += 1;
            trg_countdown -= 1;
        }
        if src_countdown == 0 || trg_countdown == 0 {
            break;
        }
    }
    debug_assert!(src_countdown == 0 && trg_countdown == 0);
    debug_assert!(walker.is_aligned(Alignment::Lo));

    true
}

pub fn copy_preserve_sum<T>(src: Line<'_, T>, trg: &mut LineMut<'_, T>) -> bool
where
    T: Scalar,
{
    resample(Preserve::Sum, Combine::Copy, None, src, trg)
}

pub fn copy_preserve_area<T>(src: Line<'_, T>, trg: &mut LineMut<'_, T>) -> bool
where
    T: Scalar,
{
    resample(Preserve::Area, Combine::Copy, None, src, trg)
}

pub fn accumulate_preserve_sum<T>(src: Line<'_, T>, trg: &mut LineMut<'_, T>) -> bool
where
    T: Scalar,
{
    resample(Preserve::Sum, Combine::Accumulate, None, src, trg)
}

pub fn accumulate_preserve_area<T>(src: Line<'_, T>, trg: &mut LineMut<'_, T>) -> bool
where
    T: Scalar,
{
    resample(Preserve::Area, Combine::Accumulate, None, src, trg)
}

pub fn scaled_copy_preserve_sum<T>(
    scale: T,
    src: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
) -> bool
where
    T: Scalar,
{
    resample(Preserve::Sum, Combine::Copy, Some(scale), src, trg)
}

pub fn scaled_copy_preserve_area<T>(
    scale: T,
    src: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
) -> bool
where
    T: Scalar,
{
    resample(Preserve::Area, Combine::Copy, Some(scale), src, trg)
}

pub fn scaled_accumulate_preserve_sum<T>(
    scale: T,
    src: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
) -> bool
where
    T: Scalar,
{
    resample(Preserve::Sum, Combine::Accumulate, Some(scale), src, trg)
}

pub fn scaled_accumulate_preserve_area<T>(
    scale: T,
    src: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
) -> bool
where
    T: Scalar,
{
    resample(Preserve::Area, Combine::Accumulate, Some(scale), src, trg)
}

// _______________________________________________________________________
