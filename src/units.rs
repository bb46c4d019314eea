//! Fixed-point fluid unit arithmetic.
//!
//! All fluid quantities in the engine are integers. One block of vertical space
//! is subdivided into `LEVELS_PER_BLOCK` levels, and one level holds
//! `UNITS_PER_LEVEL` fluid units, so a full voxel is 12,000 units. Integer
//! arithmetic keeps equalization exact and free of floating-point drift.

/// Fluid units per vertical level (1/12th of a block).
pub const UNITS_PER_LEVEL: i32 = 1000;

/// Vertical levels per block. Matches the 12-step flow heights used by
/// partial solid and partial fluid blocks.
pub const LEVELS_PER_BLOCK: i32 = 12;

/// Fluid units in one completely full voxel.
pub const UNITS_PER_BLOCK: i32 = UNITS_PER_LEVEL * LEVELS_PER_BLOCK;

/// Converts a level coordinate to fluid units.
#[inline]
pub fn level_to_units(level: i32) -> i32 {
    level * UNITS_PER_LEVEL
}

/// Converts a fluid quantity to levels, rounding up. Used for visible surface
/// computation so that any non-empty cell renders at least one level of fluid.
#[inline]
pub fn units_to_levels_ceil(units: i32) -> i32 {
    (units + UNITS_PER_LEVEL - 1).div_euclid(UNITS_PER_LEVEL)
}

/// Integer division rounding toward positive infinity for non-negative
/// numerators. Used by the pressure flow formulas to bias rounding so the
/// source cell never equalizes below the target.
#[inline]
pub fn ceil_div(numerator: i32, divisor: i32) -> i32 {
    debug_assert!(divisor > 0);
    if numerator >= 0 {
        (numerator + divisor - 1) / divisor
    } else {
        numerator / divisor
    }
}
