//! Hilbert curve mapping properties

use pixelmap::{HilbertCurve, PixelMapError};
use proptest::prelude::*;
use std::collections::HashSet;

#[test]
fn test_bijection_small_orders() {
    for order in 1..=10u32 {
        let curve = HilbertCurve::new(order).unwrap();
        let mut seen = HashSet::with_capacity(curve.len() as usize);

        for index in 0..curve.len() {
            let (x, y) = curve.index_to_xy(index).unwrap();
            assert!(x < curve.side() && y < curve.side());
            assert!(seen.insert((x, y)), "order {} revisits ({}, {})", order, x, y);
            assert_eq!(curve.xy_to_index(x, y).unwrap(), index);
        }
        assert_eq!(seen.len() as u64, curve.len());
    }
}

#[test]
fn test_consecutive_indices_are_neighbors() {
    let curve = HilbertCurve::new(5).unwrap();
    assert!(curve.locality_ratio(u64::MAX) >= 0.9);

    let large = HilbertCurve::for_grid(4096).unwrap();
    assert!(large.locality_ratio(10_000) >= 0.9);
}

#[test]
fn test_invalid_orders_and_coordinates() {
    assert!(matches!(HilbertCurve::new(0), Err(PixelMapError::InvalidGrid(_))));
    assert!(HilbertCurve::new(17).is_err());
    assert!(HilbertCurve::for_grid(100).is_err());

    let curve = HilbertCurve::new(3).unwrap();
    assert!(matches!(curve.index_to_xy(64), Err(PixelMapError::OutOfBounds(_))));
    assert!(curve.xy_to_index(8, 0).is_err());
}

proptest! {
    #[test]
    fn prop_roundtrip_large_order(index in 0u64..(1u64 << 32)) {
        let curve = HilbertCurve::new(16).unwrap();
        let (x, y) = curve.index_to_xy(index).unwrap();
        prop_assert_eq!(curve.xy_to_index(x, y).unwrap(), index);
    }

    #[test]
    fn prop_step_is_one_cell(order in 1u32..=12, seed in any::<u64>()) {
        let curve = HilbertCurve::new(order).unwrap();
        let index = seed % (curve.len() - 1);
        let (x0, y0) = curve.index_to_xy(index).unwrap();
        let (x1, y1) = curve.index_to_xy(index + 1).unwrap();
        let manhattan = x0.abs_diff(x1) + y0.abs_diff(y1);
        prop_assert_eq!(manhattan, 1);
    }
}
