//! In-loop deblocking filter primitives for VP8.
//!
//! Edge filters in the integer form of RFC 6386 §15. Pixels are addressed
//! as `buf[point + k * step]` where `step` is 1 for a vertical edge
//! (neighbors left/right) and the row stride for a horizontal edge. The
//! pixel at `point` is Q0, the first pixel past the edge.

fn u2s(v: u8) -> i32 {
    i32::from(v) - 128
}

fn s2u(v: i32) -> u8 {
    (v.clamp(-128, 127) + 128) as u8
}

fn c(v: i32) -> i32 {
    v.clamp(-128, 127)
}

fn diff(a: u8, b: u8) -> i32 {
    (i32::from(a) - i32::from(b)).abs()
}

/// `|p0 − q0|·2 + |p1 − q1|/2 ≤ edge_limit`, shared by both filter modes.
fn simple_threshold(buf: &[u8], point: usize, step: usize, edge_limit: i32) -> bool {
    diff(buf[point - step], buf[point]) * 2 + diff(buf[point - 2 * step], buf[point + step]) / 2
        <= edge_limit
}

fn should_filter(buf: &[u8], point: usize, step: usize, interior_limit: i32, edge_limit: i32) -> bool {
    simple_threshold(buf, point, step, edge_limit)
        && diff(buf[point - 4 * step], buf[point - 3 * step]) <= interior_limit
        && diff(buf[point - 3 * step], buf[point - 2 * step]) <= interior_limit
        && diff(buf[point - 2 * step], buf[point - step]) <= interior_limit
        && diff(buf[point + 3 * step], buf[point + 2 * step]) <= interior_limit
        && diff(buf[point + 2 * step], buf[point + step]) <= interior_limit
        && diff(buf[point + step], buf[point]) <= interior_limit
}

fn high_edge_variance(buf: &[u8], point: usize, step: usize, hev_threshold: i32) -> bool {
    diff(buf[point - 2 * step], buf[point - step]) > hev_threshold
        || diff(buf[point + step], buf[point]) > hev_threshold
}

/// Adjusts P0/Q0 (and feeds back the filter value for the P1/Q1 update).
fn common_adjust(buf: &mut [u8], point: usize, step: usize, use_outer_taps: bool) -> i32 {
    let p1 = u2s(buf[point - 2 * step]);
    let p0 = u2s(buf[point - step]);
    let q0 = u2s(buf[point]);
    let q1 = u2s(buf[point + step]);

    let outer = if use_outer_taps { c(p1 - q1) } else { 0 };
    let a = c(outer + 3 * (q0 - p0));

    let f = c(a + 4) >> 3;
    let e = c(a + 3) >> 3;

    buf[point] = s2u(q0 - f);
    buf[point - step] = s2u(p0 + e);

    f
}

/// Simple-mode filter: a clip-limited update of the pixel pair straddling
/// the edge.
fn simple_segment(buf: &mut [u8], point: usize, step: usize, edge_limit: i32) {
    if simple_threshold(buf, point, step, edge_limit) {
        common_adjust(buf, point, step, true);
    }
}

pub(crate) fn simple_segment_vertical(buf: &mut [u8], point: usize, edge_limit: i32) {
    simple_segment(buf, point, 1, edge_limit);
}

pub(crate) fn simple_segment_horizontal(buf: &mut [u8], point: usize, stride: usize, edge_limit: i32) {
    simple_segment(buf, point, stride, edge_limit);
}

/// Normal-mode filter for subblock edges. Without high edge variance the
/// outer pixel pair receives half the inner adjustment.
fn subblock(
    buf: &mut [u8],
    point: usize,
    step: usize,
    hev_threshold: i32,
    interior_limit: i32,
    edge_limit: i32,
) {
    if !should_filter(buf, point, step, interior_limit, edge_limit) {
        return;
    }

    let hev = high_edge_variance(buf, point, step, hev_threshold);
    let f = common_adjust(buf, point, step, hev);

    if !hev {
        let a = (f + 1) >> 1;
        buf[point + step] = s2u(u2s(buf[point + step]) - a);
        buf[point - 2 * step] = s2u(u2s(buf[point - 2 * step]) + a);
    }
}

pub(crate) fn subblock_filter_vertical(
    buf: &mut [u8],
    point: usize,
    hev_threshold: i32,
    interior_limit: i32,
    edge_limit: i32,
) {
    subblock(buf, point, 1, hev_threshold, interior_limit, edge_limit);
}

pub(crate) fn subblock_filter_horizontal(
    buf: &mut [u8],
    point: usize,
    stride: usize,
    hev_threshold: i32,
    interior_limit: i32,
    edge_limit: i32,
) {
    subblock(buf, point, stride, hev_threshold, interior_limit, edge_limit);
}

/// Normal-mode filter for macroblock edges: a wider 6-tap update touching
/// three pixels on each side unless the edge shows high variance.
fn macroblock(
    buf: &mut [u8],
    point: usize,
    step: usize,
    hev_threshold: i32,
    interior_limit: i32,
    edge_limit: i32,
) {
    if !should_filter(buf, point, step, interior_limit, edge_limit) {
        return;
    }

    if high_edge_variance(buf, point, step, hev_threshold) {
        common_adjust(buf, point, step, true);
        return;
    }

    let p2 = u2s(buf[point - 3 * step]);
    let p1 = u2s(buf[point - 2 * step]);
    let p0 = u2s(buf[point - step]);
    let q0 = u2s(buf[point]);
    let q1 = u2s(buf[point + step]);
    let q2 = u2s(buf[point + 2 * step]);

    let w = c(c(p1 - q1) + 3 * (q0 - p0));

    let a = c((27 * w + 63) >> 7);
    buf[point] = s2u(q0 - a);
    buf[point - step] = s2u(p0 + a);

    let a = c((18 * w + 63) >> 7);
    buf[point + step] = s2u(q1 - a);
    buf[point - 2 * step] = s2u(p1 + a);

    let a = c((9 * w + 63) >> 7);
    buf[point + 2 * step] = s2u(q2 - a);
    buf[point - 3 * step] = s2u(p2 + a);
}

pub(crate) fn macroblock_filter_vertical(
    buf: &mut [u8],
    point: usize,
    hev_threshold: i32,
    interior_limit: i32,
    edge_limit: i32,
) {
    macroblock(buf, point, 1, hev_threshold, interior_limit, edge_limit);
}

pub(crate) fn macroblock_filter_horizontal(
    buf: &mut [u8],
    point: usize,
    stride: usize,
    hev_threshold: i32,
    interior_limit: i32,
    edge_limit: i32,
) {
    macroblock(buf, point, stride, hev_threshold, interior_limit, edge_limit);
}

#[cfg(test)]
mod tests {
    use super::*;

    // 8 pixels across a vertical edge, Q0 at index 4.
    fn run_simple(mut row: [u8; 8], edge_limit: i32) -> [u8; 8] {
        simple_segment_vertical(&mut row, 4, edge_limit);
        row
    }

    #[test]
    fn flat_region_is_untouched() {
        assert_eq!(run_simple([80; 8], 40), [80; 8]);
    }

    #[test]
    fn filtering_is_idempotent_on_smooth_ramps() {
        let smooth = [78, 79, 80, 81, 82, 83, 84, 85];
        let once = run_simple(smooth, 40);
        let twice = run_simple(once, 40);
        assert_eq!(once, twice);
    }

    #[test]
    fn hard_edge_is_softened_in_normal_mode() {
        let mut row = [60u8, 60, 60, 60, 100, 100, 100, 100];
        macroblock_filter_vertical(&mut row, 4, 0, 40, 120);
        // The step is redistributed over six pixels and shrinks at the edge.
        let step = (i32::from(row[4]) - i32::from(row[3])).abs();
        assert!(step < 40);
        assert!(row[2] > 60 && row[5] < 100);
    }

    #[test]
    fn threshold_blocks_strong_edges() {
        let row = [0u8, 0, 0, 0, 255, 255, 255, 255];
        assert_eq!(run_simple(row, 40), row);
    }
}
