//! Rectangular row-major grids of per-tile values

use crate::error::{Result, TilingError};

/// A `rows x cols` arrangement of values, stored row-major
///
/// Prompts, guidance overrides, seeds and seed modes all live in grids that
/// must share the prompt grid's shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    rows: usize,
    cols: usize,
    cells: Vec<T>,
}

impl<T> Grid<T> {
    /// Build a grid from nested rows, rejecting empty or ragged input
    ///
    /// `name` is only used in error messages.
    pub fn from_rows(name: &'static str, rows: Vec<Vec<T>>) -> Result<Self> {
        let num_rows = rows.len();
        let num_cols = rows.first().map(Vec::len).unwrap_or(0);
        if num_rows == 0 || num_cols == 0 {
            return Err(TilingError::EmptyGrid { name });
        }

        let mut cells = Vec::with_capacity(num_rows * num_cols);
        for (row, values) in rows.into_iter().enumerate() {
            if values.len() != num_cols {
                return Err(TilingError::RaggedGrid {
                    name,
                    row,
                    expected: num_cols,
                    found: values.len(),
                });
            }
            cells.extend(values);
        }

        Ok(Self {
            rows: num_rows,
            cols: num_cols,
            cells,
        })
    }

    /// Build a grid by evaluating `f(row, col)` for every cell
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut cells = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                cells.push(f(row, col));
            }
        }
        Self { rows, cols, cells }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        if row < self.rows && col < self.cols {
            self.cells.get(row * self.cols + col)
        } else {
            None
        }
    }

    /// Iterate `((row, col), value)` in row-major order
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), &T)> {
        let cols = self.cols;
        self.cells
            .iter()
            .enumerate()
            .map(move |(i, value)| ((i / cols, i % cols), value))
    }

    /// Apply `f` to every cell, keeping the shape
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Grid<U> {
        Grid {
            rows: self.rows,
            cols: self.cols,
            cells: self.cells.iter().map(f).collect(),
        }
    }

    /// Fail unless this grid has the given shape
    pub fn expect_shape(&self, name: &'static str, expected: (usize, usize)) -> Result<()> {
        if self.shape() == expected {
            Ok(())
        } else {
            Err(TilingError::GridShapeMismatch {
                name,
                expected,
                found: self.shape(),
            })
        }
    }
}

impl<T> std::ops::Index<(usize, usize)> for Grid<T> {
    type Output = T;

    fn index(&self, (row, col): (usize, usize)) -> &T {
        assert!(
            row < self.rows && col < self.cols,
            "grid index ({row}, {col}) out of bounds for {}x{} grid",
            self.rows,
            self.cols
        );
        &self.cells[row * self.cols + col]
    }
}
