//! Per-pixel owner index used to turn a mask of bad pixels into a mask of points.

use burn::prelude::Backend;
use burn::tensor::{Bool, Tensor};
use gsmap_scene::masks;
use tracing::trace_span;

/// Marks a pixel that no point projects to.
pub const UNCLAIMED: i64 = -1;

/// Row-major `height * width` array holding, for every pixel, the index of the point
/// that claims it or [`UNCLAIMED`].
///
/// When several points land on the same pixel the one with the highest index wins, so
/// the map only depends on the point order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScreenIndexMap {
    width: usize,
    height: usize,
    owners: Vec<i64>,
}

fn pixel_coord(normalized: f32, size: usize) -> usize {
    let max = size as i64 - 1;
    // Truncates toward zero, so slightly negative coordinates still land on 0.
    let coord = (normalized * max as f32) as i64;
    coord.clamp(0, max) as usize
}

impl ScreenIndexMap {
    /// Build the map from points whose first two columns are screen positions already
    /// normalized to `[0, 1]`. Positions outside that range are clamped to the border.
    pub fn build<B: Backend>(positions: Tensor<B, 2>, width: usize, height: usize) -> Self {
        let _span = trace_span!("Build screen map", width, height).entered();

        let mut owners = vec![UNCLAIMED; width * height];
        let [num_points, cols] = positions.dims();
        if owners.is_empty() || num_points == 0 {
            return Self {
                width,
                height,
                owners,
            };
        }

        let coords: Vec<f32> = positions
            .slice([0..num_points, 0..cols.min(2)])
            .into_data()
            .convert::<f32>()
            .to_vec()
            .expect("converted to f32");

        for (point, xy) in coords.chunks_exact(2).enumerate() {
            let x = pixel_coord(xy[0], width);
            let y = pixel_coord(xy[1], height);
            owners[y * width + x] = point as i64;
        }

        Self {
            width,
            height,
            owners,
        }
    }

    /// Owner of pixel `(x, y)`, `None` when unclaimed or out of bounds.
    pub fn owner(&self, x: usize, y: usize) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        usize::try_from(self.owners[y * self.width + x]).ok()
    }

    pub fn num_claimed(&self) -> usize {
        self.owners
            .iter()
            .filter(|&&owner| owner != UNCLAIMED)
            .count()
    }

    /// Mark every point that owns at least one set pixel of `pixels` (row-major,
    /// `height * width` entries). Unclaimed pixels are ignored.
    pub fn owners_of<B: Backend>(
        &self,
        pixels: Tensor<B, 1, Bool>,
        num_points: usize,
    ) -> Tensor<B, 1, Bool> {
        let device = pixels.device();
        let mut marked = vec![false; num_points];

        if !self.owners.is_empty() {
            let pixels = masks::to_bools(pixels);
            for (&flagged, &owner) in pixels.iter().zip(&self.owners) {
                if let Ok(owner) = usize::try_from(owner) {
                    if flagged && owner < num_points {
                        marked[owner] = true;
                    }
                }
            }
        }

        masks::from_bools(marked, &device)
    }
}
