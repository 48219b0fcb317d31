// THEORY:
// The `blob_detector` turns a per-pixel foreground mask into the one region the
// rest of the engine cares about: the largest connected patch of change.
//
// Steps:
// 1.  **Dilation**: The raw mask is dilated with a 3x3 square a configurable number
//     of times. Moving objects rarely difference cleanly; dilation closes the
//     pinholes and thin cracks so one object becomes one region.
// 2.  **Region Growing**: Every unvisited foreground pixel seeds a flood fill over
//     its 4-connected neighbors. A shared `visited` grid guarantees each pixel is
//     claimed by exactly one region.
// 3.  **Selection**: Only the region with the largest area is kept, reduced to its
//     area and inclusive bounding box.
//
// Like the rest of the spatial layer it is stateless: one mask in, one answer out.

use crate::core_modules::blob::{Blob, BoundingBox, Point};

pub mod blob_detector {
    use super::*;

    /// Grows every foreground pixel into its 3x3 neighborhood, `iterations` times.
    pub fn dilate(mask: &[bool], width: u32, height: u32, iterations: u32) -> Vec<bool> {
        let w = width as usize;
        let h = height as usize;
        let mut current = mask.to_vec();

        for _ in 0..iterations {
            let mut next = vec![false; current.len()];
            for y in 0..h {
                for x in 0..w {
                    if !current[y * w + x] {
                        continue;
                    }
                    let y0 = y.saturating_sub(1);
                    let y1 = (y + 1).min(h - 1);
                    let x0 = x.saturating_sub(1);
                    let x1 = (x + 1).min(w - 1);
                    for ny in y0..=y1 {
                        for nx in x0..=x1 {
                            next[ny * w + nx] = true;
                        }
                    }
                }
            }
            current = next;
        }

        current
    }

    /// Finds the largest 4-connected foreground region. Ties keep the region
    /// found first in scan order.
    pub fn find_largest_blob(mask: &[bool], width: u32, height: u32) -> Option<Blob> {
        let w = width as usize;
        let h = height as usize;
        let mut visited = vec![false; mask.len()];
        let mut best: Option<Blob> = None;

        for start in 0..mask.len() {
            if !mask[start] || visited[start] {
                continue;
            }

            let blob = grow_region(start, mask, &mut visited, w, h);
            if best.as_ref().map_or(true, |b| blob.area > b.area) {
                best = Some(blob);
            }
        }

        best
    }

    /// Flood fill from `start`, marking every pixel it claims in `visited`.
    fn grow_region(start: usize, mask: &[bool], visited: &mut [bool], w: usize, h: usize) -> Blob {
        let mut queue: Vec<usize> = vec![start];
        visited[start] = true;

        let mut area = 0u32;
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);

        while let Some(index) = queue.pop() {
            let x = index % w;
            let y = index / w;
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            // 4 direct neighbors, no diagonals.
            let mut visit = |nx: usize, ny: usize| {
                let n = ny * w + nx;
                if mask[n] && !visited[n] {
                    visited[n] = true;
                    queue.push(n);
                }
            };
            if x > 0 {
                visit(x - 1, y);
            }
            if x + 1 < w {
                visit(x + 1, y);
            }
            if y > 0 {
                visit(x, y - 1);
            }
            if y + 1 < h {
                visit(x, y + 1);
            }
        }

        Blob {
            area,
            bounding_box: BoundingBox {
                min: Point {
                    x: min_x as u32,
                    y: min_y as u32,
                },
                max: Point {
                    x: max_x as u32,
                    y: max_y as u32,
                },
            },
        }
    }
}
