//! Hilbert curve addressing
//!
//! Maps a linear index onto a square grid of side `2^order` and back.
//! Uses the standard rotate/reflect recursion, one quadrant per level.
//! Both directions check their bounds up front and fail there, never
//! partway through the recursion.

use crate::error::{PixelMapError, Result};

/// Largest supported order (65536 x 65536 grid)
pub const MAX_ORDER: u32 = 16;

/// A Hilbert curve over a `side x side` grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HilbertCurve {
    order: u32,
    side: u64,
}

impl HilbertCurve {
    /// Create a curve for a grid of side `2^order`
    pub fn new(order: u32) -> Result<Self> {
        if order == 0 || order > MAX_ORDER {
            return Err(PixelMapError::InvalidGrid(format!(
                "order must be in 1..={}, got {}",
                MAX_ORDER, order
            )));
        }
        Ok(HilbertCurve {
            order,
            side: 1u64 << order,
        })
    }

    /// Create a curve from a grid side length, which must be a power of two
    pub fn for_grid(grid_size: u32) -> Result<Self> {
        if grid_size < 2 || !grid_size.is_power_of_two() {
            return Err(PixelMapError::InvalidGrid(format!(
                "grid size must be a power of two >= 2, got {}",
                grid_size
            )));
        }
        Self::new(grid_size.trailing_zeros())
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    /// Grid side length
    pub fn side(&self) -> u32 {
        self.side as u32
    }

    /// Number of cells on the curve
    pub fn len(&self) -> u64 {
        self.side * self.side
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Convert a linear index to `(x, y)`
    pub fn index_to_xy(&self, index: u64) -> Result<(u32, u32)> {
        if index >= self.len() {
            return Err(PixelMapError::OutOfBounds(format!(
                "index {} outside curve of length {}",
                index,
                self.len()
            )));
        }

        let mut t = index;
        let (mut x, mut y) = (0u64, 0u64);
        let mut s = 1u64;
        while s < self.side {
            let rx = 1 & (t / 2);
            let ry = 1 & (t ^ rx);
            rotate(s, &mut x, &mut y, rx, ry);
            x += s * rx;
            y += s * ry;
            t /= 4;
            s *= 2;
        }

        Ok((x as u32, y as u32))
    }

    /// Convert `(x, y)` to its linear index
    pub fn xy_to_index(&self, x: u32, y: u32) -> Result<u64> {
        if x as u64 >= self.side || y as u64 >= self.side {
            return Err(PixelMapError::OutOfBounds(format!(
                "({}, {}) outside {}x{} grid",
                x, y, self.side, self.side
            )));
        }

        let (mut x, mut y) = (x as u64, y as u64);
        let mut d = 0u64;
        let mut s = self.side / 2;
        while s > 0 {
            let rx = u64::from(x & s > 0);
            let ry = u64::from(y & s > 0);
            d += s * s * ((3 * rx) ^ ry);
            rotate(self.side, &mut x, &mut y, rx, ry);
            s /= 2;
        }

        Ok(d)
    }

    /// Fraction of consecutive index pairs whose cells are exactly one step apart
    ///
    /// Checks the first `samples` pairs (or every pair when the curve is
    /// shorter). A correct curve reports 1.0.
    pub fn locality_ratio(&self, samples: u64) -> f64 {
        let pairs = samples.min(self.len() - 1);
        if pairs == 0 {
            return 1.0;
        }

        let mut adjacent = 0u64;
        let mut prev = (0u32, 0u32);
        for i in 0..=pairs {
            let Ok(cur) = self.index_to_xy(i) else {
                break;
            };
            if i > 0 {
                let dx = cur.0 as f64 - prev.0 as f64;
                let dy = cur.1 as f64 - prev.1 as f64;
                if ((dx * dx + dy * dy).sqrt() - 1.0).abs() < f64::EPSILON {
                    adjacent += 1;
                }
            }
            prev = cur;
        }

        adjacent as f64 / pairs as f64
    }
}

fn rotate(n: u64, x: &mut u64, y: &mut u64, rx: u64, ry: u64) {
    if ry == 0 {
        if rx == 1 {
            *x = n - 1 - *x;
            *y = n - 1 - *y;
        }
        std::mem::swap(x, y);
    }
}

/// Convert a linear index to `(x, y)` on a grid of side `2^order`
pub fn index_to_xy(index: u64, order: u32) -> Result<(u32, u32)> {
    HilbertCurve::new(order)?.index_to_xy(index)
}

/// Convert `(x, y)` on a grid of side `2^order` to its linear index
pub fn xy_to_index(x: u32, y: u32, order: u32) -> Result<u64> {
    HilbertCurve::new(order)?.xy_to_index(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_one_layout() {
        let curve = HilbertCurve::new(1).unwrap();
        let cells: Vec<_> = (0..4).map(|i| curve.index_to_xy(i).unwrap()).collect();
        assert_eq!(cells, vec![(0, 0), (0, 1), (1, 1), (1, 0)]);
    }

    #[test]
    fn test_round_trip_order_four() {
        let curve = HilbertCurve::new(4).unwrap();
        for i in 0..curve.len() {
            let (x, y) = curve.index_to_xy(i).unwrap();
            assert_eq!(curve.xy_to_index(x, y).unwrap(), i);
        }
    }

    #[test]
    fn test_rejects_bad_grids() {
        assert!(matches!(
            HilbertCurve::new(0),
            Err(PixelMapError::InvalidGrid(_))
        ));
        assert!(matches!(
            HilbertCurve::new(17),
            Err(PixelMapError::InvalidGrid(_))
        ));
        assert!(matches!(
            HilbertCurve::for_grid(100),
            Err(PixelMapError::InvalidGrid(_))
        ));
        assert_eq!(HilbertCurve::for_grid(256).unwrap().order(), 8);
    }

    #[test]
    fn test_out_of_range() {
        let curve = HilbertCurve::new(3).unwrap();
        assert!(matches!(
            curve.index_to_xy(64),
            Err(PixelMapError::OutOfBounds(_))
        ));
        assert!(matches!(
            curve.xy_to_index(8, 0),
            Err(PixelMapError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_locality_is_perfect() {
        let curve = HilbertCurve::new(5).unwrap();
        assert!((curve.locality_ratio(u64::MAX) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_free_functions() {
        let (x, y) = index_to_xy(37, 6).unwrap();
        assert_eq!(xy_to_index(x, y, 6).unwrap(), 37);
    }
}
