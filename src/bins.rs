use itertools::Itertools;
use ndarray::Array1;

/// Relative spacing below which two height levels are merged.
const LEVEL_MERGE_FRACTION: f64 = 1e-9;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angles_are_uniform_and_open() {
        let thetas = angle_grid(8);
        assert_eq!(thetas.len(), 8);
        assert_eq!(thetas[0], 0.0);
        assert_eq!(thetas[2], 90.0);
        assert_eq!(thetas[7], 315.0);
    }

    #[test]
    fn levels_include_extras_once() {
        let levels = height_levels(0.0, 10.0, 3, &[5.0, 7.5, 7.5, 12.0]);
        assert_eq!(levels, vec![0.0, 5.0, 7.5, 10.0]);
    }

    #[test]
    fn combinations_are_row_major() {
        let combos = generate_theta_z_combinations(&angle_grid(4), &[1.0, 2.0]);
        assert_eq!(combos.len(), 8);
        assert_eq!(combos[0], (0.0, 1.0));
        assert_eq!(combos[3], (270.0, 1.0));
        assert_eq!(combos[4], (0.0, 2.0));
    }
}

/// `n` compass angles in degrees, `k * 360 / n` for `k` in `0..n`.
pub fn angle_grid(n: usize) -> Array1<f64> {
    Array1::from_iter((0..n).map(|k| 360.0 * k as f64 / n as f64))
}

/// `n` evenly spaced elevations from `base` to `apex` inclusive, merged with
/// any `extra` elevations inside that range. Sorted and without duplicates.
pub fn height_levels(base: f64, apex: f64, n: usize, extra: &[f64]) -> Vec<f64> {
    let tolerance = (apex - base).abs() * LEVEL_MERGE_FRACTION;
    let mut levels = Array1::linspace(base, apex, n).to_vec();
    if let Some(last) = levels.last_mut() {
        // linspace may land an ulp away from the apex
        *last = apex;
    }
    levels.extend(extra.iter().copied().filter(|z| *z > base && *z < apex));
    levels.sort_by(f64::total_cmp);
    levels
        .into_iter()
        .coalesce(|a, b| {
            if (b - a).abs() <= tolerance {
                // keep the exact level over its near-duplicate grid neighbour
                if extra.contains(&b) {
                    Ok(b)
                } else {
                    Ok(a)
                }
            } else {
                Err((a, b))
            }
        })
        .collect()
}

/// Flattens every (theta, z) pair, z-major so each ring is contiguous.
pub fn generate_theta_z_combinations(thetas: &Array1<f64>, zs: &[f64]) -> Vec<(f64, f64)> {
    zs.iter()
        .flat_map(|&z| thetas.iter().map(move |&theta| (theta, z)))
        .collect()
}
