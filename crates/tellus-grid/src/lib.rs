//! Grid storage and neighborhood queries for the Tellus world.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by grid storage.
#[derive(Debug, Error)]
pub enum GridError {
    /// Indicates dimensions that cannot back a grid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// The eight Moore offsets, in the fixed order used by every neighborhood sweep.
pub const MOORE_OFFSETS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Rectangular cell store of fixed `width × height`, indexed `(x, y)` with
/// `x` the fast axis. The grid is never resized after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid<T> {
    width: u32,
    height: u32,
    cells: Vec<T>,
}

impl<T: Default + Clone> Grid<T> {
    /// Construct a grid with every cell set to `T::default()`.
    pub fn new(width: u32, height: u32) -> Result<Self, GridError> {
        if width == 0 || height == 0 {
            return Err(GridError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        Ok(Self {
            width,
            height,
            cells: vec![T::default(); (width as usize) * (height as usize)],
        })
    }
}

impl<T> Grid<T> {
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Returns the flat index for `(x, y)` without bounds checks.
    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    /// Returns whether `(x, y)` lies inside the grid.
    #[must_use]
    pub const fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }

    /// Immutable access to a specific cell.
    pub fn get(&self, x: u32, y: u32) -> Option<&T> {
        if self.contains(x, y) {
            Some(&self.cells[self.offset(x, y)])
        } else {
            None
        }
    }

    /// Mutable access to a specific cell.
    pub fn get_mut(&mut self, x: u32, y: u32) -> Option<&mut T> {
        if self.contains(x, y) {
            let idx = self.offset(x, y);
            Some(&mut self.cells[idx])
        } else {
            None
        }
    }

    /// Immutable access to the backing cell slice in row-major order.
    #[must_use]
    pub fn cells(&self) -> &[T] {
        &self.cells
    }

    /// Mutable access to the backing cell slice in row-major order.
    #[must_use]
    pub fn cells_mut(&mut self) -> &mut [T] {
        &mut self.cells
    }

    /// Iterate over every coordinate in row-major order.
    pub fn coords(&self) -> CoordIter {
        CoordIter {
            width: self.width,
            height: self.height,
            next: 0,
        }
    }

    /// The grid's logical origin: its geometric center.
    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        (self.width as f32 / 2.0, self.height as f32 / 2.0)
    }

    /// Euclidean distance from `(x, y)` to the grid center.
    #[must_use]
    pub fn distance_to_center(&self, x: u32, y: u32) -> f32 {
        let (cx, cy) = self.center();
        (x as f32 - cx).hypot(y as f32 - cy)
    }

    /// Iterate over the in-bounds Moore neighbors of `(x, y)`.
    ///
    /// Order follows [`MOORE_OFFSETS`] and is stable across calls. Edge cells
    /// yield fewer than eight neighbors; there is no wrap-around.
    #[must_use]
    pub fn moore_neighbors(&self, x: u32, y: u32) -> MooreNeighbors {
        MooreNeighbors {
            width: self.width,
            height: self.height,
            x: i64::from(x),
            y: i64::from(y),
            next: 0,
        }
    }
}

/// Iterator over the in-bounds Moore neighbors of one cell.
#[derive(Debug, Clone)]
pub struct MooreNeighbors {
    width: u32,
    height: u32,
    x: i64,
    y: i64,
    next: usize,
}

impl Iterator for MooreNeighbors {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < MOORE_OFFSETS.len() {
            let (dx, dy) = MOORE_OFFSETS[self.next];
            self.next += 1;
            let nx = self.x + i64::from(dx);
            let ny = self.y + i64::from(dy);
            if nx >= 0 && ny >= 0 && nx < i64::from(self.width) && ny < i64::from(self.height) {
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                return Some((nx as u32, ny as u32));
            }
        }
        None
    }
}

/// Iterator over every grid coordinate in row-major order.
#[derive(Debug, Clone)]
pub struct CoordIter {
    width: u32,
    height: u32,
    next: u64,
}

impl Iterator for CoordIter {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        let total = u64::from(self.width) * u64::from(self.height);
        if self.next >= total {
            return None;
        }
        let x = (self.next % u64::from(self.width)) as u32;
        let y = (self.next / u64::from(self.width)) as u32;
        self.next += 1;
        Some((x, y))
    }
}

/// Flat scalar field used as a staging buffer for double-buffered sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarField {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl ScalarField {
    /// Construct a field of zeroes matching `width × height`.
    pub fn new(width: u32, height: u32) -> Result<Self, GridError> {
        if width == 0 || height == 0 {
            return Err(GridError::InvalidConfig(
                "field dimensions must be non-zero",
            ));
        }
        Ok(Self {
            width,
            height,
            values: vec![0.0; (width as usize) * (height as usize)],
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    /// Immutable access to a specific value.
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x < self.width && y < self.height {
            Some(self.values[self.offset(x, y)])
        } else {
            None
        }
    }

    /// Mutable access to a specific value.
    pub fn get_mut(&mut self, x: u32, y: u32) -> Option<&mut f32> {
        if x < self.width && y < self.height {
            let idx = self.offset(x, y);
            Some(&mut self.values[idx])
        } else {
            None
        }
    }

    /// Fills the field with the provided scalar value.
    pub fn fill(&mut self, value: f32) {
        self.values.fill(value);
    }

    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    #[must_use]
    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    /// Bilinearly interpolate the field at a continuous point, clamping the
    /// sample position to the grid interior first.
    #[must_use]
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let cx = x.clamp(0.0, max_x);
        let cy = y.clamp(0.0, max_y);
        let x0 = cx.floor() as u32;
        let y0 = cy.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let tx = cx - x0 as f32;
        let ty = cy - y0 as f32;
        let v00 = self.values[self.offset(x0, y0)];
        let v10 = self.values[self.offset(x1, y0)];
        let v01 = self.values[self.offset(x0, y1)];
        let v11 = self.values[self.offset(x1, y1)];
        let top = v00 + (v10 - v00) * tx;
        let bottom = v01 + (v11 - v01) * tx;
        top + (bottom - top) * ty
    }
}
