use super::{DisparityMap, SgbmParams, DISP_SCALE};
use image::GrayImage;
use log::debug;
use rayon::prelude::*;

/// Intensity step at which the large-jump penalty is halved.
const P2_EDGE_SCALE: u64 = 16;

/// Storage type of the cost volumes; sums saturate instead of wrapping.
type Cost = u16;

#[inline]
fn saturate(value: u32) -> Cost {
    value.min(Cost::MAX as u32) as Cost
}

pub(super) fn run(left: &GrayImage, right: &GrayImage, params: &SgbmParams) -> DisparityMap {
    let (width, height) = (left.width() as usize, left.height() as usize);
    let mut map = DisparityMap::new(left.width(), left.height(), params.min_disparity);
    if width == 0 || height == 0 {
        return map;
    }
    let depth = params.num_disparities;

    // windowed matching cost, kept for the sub-pixel step
    let mut cost = pixel_costs(left, right, params);
    box_filter(&mut cost, width, height, depth, params.block_size / 2);

    let mut summed = vec![0 as Cost; width * height * depth];
    for &(dx, dy) in params.paths.directions() {
        aggregate_path(&cost, left, &mut summed, width, height, params, dx, dy);
    }
    debug!(
        "aggregated {}x{}x{} cost volume over {} paths",
        width,
        height,
        depth,
        params.paths.directions().len()
    );

    let right_best = right_disparities(&summed, width, depth, params.min_disparity);

    // columns whose search range leaves the right image stay invalid
    let first_x = (params.min_disparity + depth as i32).max(0) as usize;
    let end_x = (width as i32 + params.min_disparity.min(0)).max(0) as usize;

    map.data
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                if x < first_x || x >= end_x {
                    continue;
                }
                let base = (y * width + x) * depth;
                let costs = &summed[base..base + depth];
                let Some(best) = select(costs, params) else {
                    continue;
                };

                let disparity = params.min_disparity + best as i32;
                if params.disp12_max_diff >= 0 {
                    let xr = x as i32 - disparity;
                    if xr < 0 || xr >= width as i32 {
                        continue;
                    }
                    let other = params.min_disparity + right_best[y * width + xr as usize] as i32;
                    if (other - disparity).abs() > params.disp12_max_diff {
                        continue;
                    }
                }

                let d16 = refine(&cost[base..base + depth], costs, best);
                *out = (params.min_disparity as i64 * DISP_SCALE as i64 + d16) as i16;
            }
        });

    map
}

/// Winner-take-all with the uniqueness test.
fn select(costs: &[Cost], params: &SgbmParams) -> Option<usize> {
    let (best, &min_cost) = costs
        .iter()
        .enumerate()
        .min_by_key(|&(d, &c)| (c, d))?;
    let ratio = 100 - params.uniqueness_ratio as u64;
    let unique = costs.iter().enumerate().all(|(d, &c)| {
        d.abs_diff(best) <= 1 || (c as u64) * ratio > (min_cost as u64) * 100
    });
    unique.then_some(best)
}

/// Sub-pixel position of `best` in 1/16 pixel.
///
/// The parabola goes through the windowed matching costs, which carry no
/// smoothness penalty and so do not pull the estimate towards the integer
/// disparity. Where those have no local minimum at `best` the aggregated
/// costs are used instead.
fn refine(matching: &[Cost], aggregated: &[Cost], best: usize) -> i64 {
    let scale = DISP_SCALE as i64;
    if best == 0 || best + 1 >= aggregated.len() {
        return best as i64 * scale;
    }
    let around = |c: &[Cost]| (c[best - 1] as i64, c[best] as i64, c[best + 1] as i64);
    let (mut prev, mut cur, mut next) = around(matching);
    if cur > prev || cur > next {
        (prev, cur, next) = around(aggregated);
    }
    let denom2 = (prev + next - 2 * cur).max(1);
    best as i64 * scale + ((prev - next) * scale + denom2).div_euclid(denom2 * 2)
}

/// Clipped horizontal Sobel response mapped to `0..=2 * cap`.
fn prefilter(image: &GrayImage, cap: i32) -> Vec<i32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let raw = image.as_raw();
    let at = |x: isize, y: isize| {
        let x = x.clamp(0, w as isize - 1) as usize;
        let y = y.clamp(0, h as isize - 1) as usize;
        raw[y * w + x] as i32
    };
    let mut out = vec![0i32; w * h];
    out.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let y = y as isize;
        for (x, value) in row.iter_mut().enumerate() {
            let x = x as isize;
            let sobel = (at(x + 1, y - 1) - at(x - 1, y - 1))
                + 2 * (at(x + 1, y) - at(x - 1, y))
                + (at(x + 1, y + 1) - at(x - 1, y + 1));
            *value = sobel.clamp(-cap, cap) + cap;
        }
    });
    out
}

/// Sampling-insensitive dissimilarity of Birchfield and Tomasi between
/// `a[xa]` and `b[xb]` on one row.
#[inline]
fn birchfield_tomasi(a: &[i32], xa: usize, b: &[i32], xb: usize) -> u32 {
    let range = |row: &[i32], x: usize| {
        let v = row[x];
        let prev = (row[x.saturating_sub(1)] + v) / 2;
        let next = (row[(x + 1).min(row.len() - 1)] + v) / 2;
        (v, prev.min(next).min(v), prev.max(next).max(v))
    };
    let (va, min_a, max_a) = range(a, xa);
    let (vb, min_b, max_b) = range(b, xb);
    let ab = 0.max(va - max_b).max(min_b - va);
    let ba = 0.max(vb - max_a).max(min_a - vb);
    ab.min(ba) as u32
}

/// Per-pixel matching cost, laid out `(y * width + x) * depth + d`.
fn pixel_costs(left: &GrayImage, right: &GrayImage, params: &SgbmParams) -> Vec<Cost> {
    let (width, height) = (left.width() as usize, left.height() as usize);
    let depth = params.num_disparities;
    let cap = params.pre_filter_cap as i32;
    let (left_grad, right_grad) = rayon::join(|| prefilter(left, cap), || prefilter(right, cap));
    let left_raw: Vec<i32> = left.as_raw().iter().map(|&v| v as i32).collect();
    let right_raw: Vec<i32> = right.as_raw().iter().map(|&v| v as i32).collect();

    let mut costs = vec![0 as Cost; width * height * depth];
    costs
        .par_chunks_mut(width * depth)
        .enumerate()
        .for_each(|(y, row)| {
            let span = y * width..(y + 1) * width;
            let (lg, rg) = (&left_grad[span.clone()], &right_grad[span.clone()]);
            let (li, ri) = (&left_raw[span.clone()], &right_raw[span]);
            for x in 0..width {
                for d in 0..depth {
                    // right pixels beyond the border repeat the edge column
                    let xr = (x as i32 - params.min_disparity - d as i32).clamp(0, width as i32 - 1)
                        as usize;
                    row[x * depth + d] = saturate(
                        birchfield_tomasi(lg, x, rg, xr) + birchfield_tomasi(li, x, ri, xr) / 4,
                    );
                }
            }
        });
    costs
}

/// Replaces every disparity slice of `volume` by its sum over a
/// `(2 * radius + 1)^2` window, clamping at the image border.
///
/// Both passes are running sums done in place; the column pass only keeps
/// copies of the rows still inside the window.
fn box_filter(volume: &mut [Cost], width: usize, height: usize, depth: usize, radius: usize) {
    if radius == 0 || width == 0 || height == 0 {
        return;
    }
    let stride = width * depth;
    volume.par_chunks_mut(stride).for_each_init(
        || vec![0 as Cost; stride],
        |scratch, row| {
            scratch.copy_from_slice(row);
            row_window_sum(scratch, row, width, depth, radius);
        },
    );
    column_window_sum(volume, stride, height, radius);
}

/// Window sums along one row of `width` cells holding `depth` costs each.
fn row_window_sum(src: &[Cost], out: &mut [Cost], width: usize, depth: usize, radius: usize) {
    let r = radius as isize;
    let cell = |x: isize| {
        let x = x.clamp(0, width as isize - 1) as usize;
        &src[x * depth..(x + 1) * depth]
    };
    let mut acc = vec![0u32; depth];
    for dx in -r..=r {
        for (a, &c) in acc.iter_mut().zip(cell(dx)) {
            *a += c as u32;
        }
    }
    for x in 0..width {
        for (o, &a) in out[x * depth..(x + 1) * depth].iter_mut().zip(&acc) {
            *o = saturate(a);
        }
        let (incoming, outgoing) = (cell(x as isize + r + 1), cell(x as isize - r));
        for ((a, &i), &o) in acc.iter_mut().zip(incoming).zip(outgoing) {
            *a = *a + i as u32 - o as u32;
        }
    }
}

/// In-place window sums down the columns of a `height x stride` volume.
fn column_window_sum(volume: &mut [Cost], stride: usize, height: usize, radius: usize) {
    let window = 2 * radius + 1;
    let r = radius as isize;
    let row_of = |y: isize| y.clamp(0, height as isize - 1) as usize;

    let mut acc = vec![0u32; stride];
    for dy in -r..=r {
        let row = &volume[row_of(dy) * stride..][..stride];
        acc.par_iter_mut()
            .zip(row.par_iter())
            .for_each(|(a, &c)| *a += c as u32);
    }

    // original contents of overwritten rows, slot y % window
    let mut saved = vec![0 as Cost; window * stride];
    for y in 0..height {
        let span = y * stride..(y + 1) * stride;
        saved[(y % window) * stride..][..stride].copy_from_slice(&volume[span.clone()]);
        volume[span]
            .par_iter_mut()
            .zip(acc.par_iter())
            .for_each(|(v, &a)| *v = saturate(a));
        if y + 1 == height {
            break;
        }
        let incoming = &volume[row_of(y as isize + r + 1) * stride..][..stride];
        let outgoing = &saved[(row_of(y as isize - r) % window) * stride..][..stride];
        acc.par_iter_mut()
            .zip(incoming.par_iter().zip(outgoing.par_iter()))
            .for_each(|(a, (&i, &o))| *a = *a + i as u32 - o as u32);
    }
}

/// One step of the path recurrence for a single pixel.
///
/// `prev` is the previous pixel's path cost along the direction, or `None`
/// at the start of a path.
#[inline]
fn path_step(
    cost: &[Cost],
    prev: Option<&[u32]>,
    p1: u32,
    p2: u32,
    current: &mut [u32],
    summed: &mut [Cost],
) {
    let depth = cost.len();
    match prev {
        None => {
            for (c, &v) in current.iter_mut().zip(cost) {
                *c = v as u32;
            }
        }
        Some(prev) => {
            let prev_min = prev.iter().copied().min().unwrap_or(0);
            let jump = prev_min.saturating_add(p2);
            for d in 0..depth {
                let mut best = prev[d].min(jump);
                if d > 0 {
                    best = best.min(prev[d - 1].saturating_add(p1));
                }
                if d + 1 < depth {
                    best = best.min(prev[d + 1].saturating_add(p1));
                }
                current[d] = (cost[d] as u32).saturating_add(best - prev_min);
            }
        }
    }
    for (s, &c) in summed.iter_mut().zip(current.iter()) {
        *s = s.saturating_add(saturate(c));
    }
}

/// Large-jump penalty for the step from intensity `b` to `a`.
#[inline]
fn edge_penalty(params: &SgbmParams, a: u8, b: u8) -> u32 {
    let step = a.abs_diff(b) as u64;
    let scaled = params.p2 as u64 * P2_EDGE_SCALE / (P2_EDGE_SCALE + step);
    (scaled as u32).max(params.p1)
}

#[allow(clippy::too_many_arguments)]
fn aggregate_path(
    cost: &[Cost],
    left: &GrayImage,
    summed: &mut [Cost],
    width: usize,
    height: usize,
    params: &SgbmParams,
    dx: i32,
    dy: i32,
) {
    let depth = params.num_disparities;
    let stride = width * depth;
    let intensity = left.as_raw();

    if dy == 0 {
        // rows are independent paths
        summed
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, sum_row)| {
                let cost_row = &cost[y * stride..(y + 1) * stride];
                let pixels = &intensity[y * width..(y + 1) * width];
                let mut prev = vec![0u32; depth];
                let mut current = vec![0u32; depth];
                let order: Vec<usize> = if dx > 0 {
                    (0..width).collect()
                } else {
                    (0..width).rev().collect()
                };
                let mut first = true;
                let mut last = 0usize;
                for x in order {
                    let span = x * depth..(x + 1) * depth;
                    let p2 = if first {
                        params.p2
                    } else {
                        edge_penalty(params, pixels[x], pixels[last])
                    };
                    path_step(
                        &cost_row[span.clone()],
                        (!first).then_some(prev.as_slice()),
                        params.p1,
                        p2,
                        &mut current,
                        &mut sum_row[span],
                    );
                    std::mem::swap(&mut prev, &mut current);
                    first = false;
                    last = x;
                }
            });
        return;
    }

    // each row depends only on the previous row along the direction
    let mut prev_row = vec![0u32; stride];
    let mut current_row = vec![0u32; stride];
    let rows: Vec<usize> = if dy > 0 {
        (0..height).collect()
    } else {
        (0..height).rev().collect()
    };
    for (step, &y) in rows.iter().enumerate() {
        let cost_row = &cost[y * stride..(y + 1) * stride];
        let sum_row = &mut summed[y * stride..(y + 1) * stride];
        let prev_y = y as i32 - dy;
        let prev = &prev_row;
        current_row
            .par_chunks_mut(depth)
            .zip(sum_row.par_chunks_mut(depth))
            .enumerate()
            .for_each(|(x, (current, sum))| {
                let px = x as i32 - dx;
                let has_prev = step > 0 && px >= 0 && px < width as i32;
                let span = x * depth..(x + 1) * depth;
                if has_prev {
                    let px = px as usize;
                    let p2 = edge_penalty(
                        params,
                        intensity[y * width + x],
                        intensity[prev_y as usize * width + px],
                    );
                    path_step(
                        &cost_row[span],
                        Some(&prev[px * depth..(px + 1) * depth]),
                        params.p1,
                        p2,
                        current,
                        sum,
                    );
                } else {
                    path_step(&cost_row[span], None, params.p1, params.p2, current, sum);
                }
            });
        std::mem::swap(&mut prev_row, &mut current_row);
    }
}

/// Best disparity index of every right-image pixel from the same aggregated
/// volume: right pixel `xr` at disparity `d` is left pixel `xr + min + d`.
fn right_disparities(summed: &[Cost], width: usize, depth: usize, min_disparity: i32) -> Vec<usize> {
    let stride = width * depth;
    let mut best = vec![0usize; summed.len() / depth];
    best.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let sums = &summed[y * stride..(y + 1) * stride];
            for (xr, out) in row.iter_mut().enumerate() {
                let mut min_cost = u32::MAX;
                for d in 0..depth {
                    let x = xr as i32 + min_disparity + d as i32;
                    if x < 0 {
                        continue;
                    }
                    if x >= width as i32 {
                        break;
                    }
                    let c = sums[x as usize * depth + d] as u32;
                    if c < min_cost {
                        min_cost = c;
                        *out = d;
                    }
                }
            }
        });
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_birchfield_tomasi_ignores_half_pixel_shift() {
        let a = [0, 10, 20, 30, 40];
        let b = [5, 15, 25, 35, 45];
        assert_eq!(birchfield_tomasi(&a, 2, &b, 2), 0);
        assert_eq!(birchfield_tomasi(&a, 2, &a, 2), 0);
        assert!(birchfield_tomasi(&a, 1, &b, 3) > 0);
    }

    #[test]
    fn test_select_rejects_ambiguous_minimum() {
        let params = SgbmParams::with_block_size(0, 16, 3);
        assert_eq!(select(&[50, 10, 12, 40, 50], &params), Some(1));
        assert_eq!(select(&[50, 10, 40, 10, 50], &params), None);
        assert_eq!(select(&[50, 100, 10, 10, 50], &params), Some(2));
    }

    #[test]
    fn test_refine_uses_unpenalized_matching_cost() {
        // true offset +0.4: matching costs 0.9 G, 0, 0.1 G; the path penalty
        // lifts both neighbours of the aggregated curve by P1
        let matching = [2000, 900, 0, 100, 2000];
        let aggregated = [2600, 1500, 0, 700, 2600];
        assert_eq!(refine(&matching, &aggregated, 2), 2 * 16 + 6);

        // no local minimum in the matching cost: aggregated costs decide
        let matching = [0, 50, 100, 20, 0];
        let aggregated = [50, 30, 10, 40, 60];
        assert_eq!(refine(&matching, &aggregated, 2), 2 * 16 - 2);

        assert_eq!(refine(&matching, &aggregated, 0), 0);
        assert_eq!(refine(&matching, &aggregated, 4), 4 * 16);
    }

    #[test]
    fn test_path_step_penalizes_jumps() {
        let cost = [4, 4, 4, 4];
        let prev = [0, 10, 10, 10];
        let mut current = [0; 4];
        let mut summed = [0; 4];
        path_step(&cost, Some(&prev), 3, 8, &mut current, &mut summed);
        assert_eq!(current, [4, 7, 12, 12]);
        assert_eq!(summed, [4, 7, 12, 12]);
    }

    #[test]
    fn test_large_penalties_saturate() {
        let params = SgbmParams {
            p1: 10,
            p2: u32::MAX,
            ..SgbmParams::with_block_size(0, 16, 3)
        };
        assert!(edge_penalty(&params, 0, 255) > params.p1);
        assert_eq!(edge_penalty(&params, 7, 7), u32::MAX);

        let cost = [Cost::MAX; 3];
        let prev = [0, u32::MAX, u32::MAX];
        let mut current = [0; 3];
        let mut summed = [Cost::MAX - 1; 3];
        path_step(&cost, Some(&prev), u32::MAX, u32::MAX, &mut current, &mut summed);
        assert_eq!(current[0], Cost::MAX as u32);
        assert_eq!(current[2], u32::MAX);
        assert!(summed.iter().all(|&s| s == Cost::MAX));
    }

    #[test]
    fn test_box_filter_sums_window() {
        let mut costs = vec![1 as Cost; 4 * 3 * 2];
        box_filter(&mut costs, 4, 3, 2, 1);
        assert!(costs.iter().all(|&v| v == 9));
    }

    #[test]
    fn test_box_filter_matches_direct_sum() {
        let (width, height, depth, radius) = (7usize, 6usize, 3usize, 2usize);
        let value = |x: usize, y: usize, d: usize| ((x * 7 + y * 13 + d * 5) % 11) as Cost;
        let mut volume: Vec<Cost> = (0..height)
            .flat_map(|y| (0..width).flat_map(move |x| (0..depth).map(move |d| value(x, y, d))))
            .collect();
        box_filter(&mut volume, width, height, depth, radius);

        let clamp = |v: isize, n: usize| v.clamp(0, n as isize - 1) as usize;
        let r = radius as isize;
        for y in 0..height {
            for x in 0..width {
                for d in 0..depth {
                    let mut expected = 0;
                    for dy in -r..=r {
                        for dx in -r..=r {
                            expected += value(
                                clamp(x as isize + dx, width),
                                clamp(y as isize + dy, height),
                                d,
                            );
                        }
                    }
                    assert_eq!(volume[(y * width + x) * depth + d], expected, "({}, {}, {})", x, y, d);
                }
            }
        }
    }
}
