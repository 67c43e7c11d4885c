/// Deterministic user-to-variant hashing.
///
/// Buckets are a MurmurHash3 (x86, 32-bit) of `"{user_id}:{seed}:{hash_seed}"`
/// reduced modulo the bucket space, so the mapping is stable across processes
/// and restarts. Changing the experiment seed reshuffles every user.

use std::io::Cursor;

use crate::models::Variant;

/// Default bucket space: allocation resolution of 0.01%.
pub const DEFAULT_BUCKET_SIZE: u32 = 10_000;

/// Map a user into `[0, bucket_size)`.
pub fn bucket(user_id: &str, seed: &str, hash_seed: &str, bucket_size: u32) -> u32 {
    let input = format!("{}:{}:{}", user_id, seed, hash_seed);
    let hash = murmur3::murmur3_32(&mut Cursor::new(input.as_bytes()), 0)
        .expect("hashing an in-memory buffer cannot fail");
    hash % bucket_size
}

/// Select the variant whose cumulative allocation range contains `bucket`.
///
/// Variants are ordered by id ascending so the ranges are stable over time;
/// the last variant absorbs any rounding remainder.
pub fn choose_variant<'a>(
    variants: &'a [Variant],
    bucket: u32,
    bucket_size: u32,
) -> Option<&'a Variant> {
    if variants.is_empty() {
        return None;
    }

    let mut ordered: Vec<&Variant> = variants.iter().collect();
    ordered.sort_by_key(|v| v.id);

    let mut cumulative: u64 = 0;
    for variant in &ordered {
        cumulative += variant.allocation_pct as u64 * bucket_size as u64 / 100;
        if (bucket as u64) < cumulative {
            return Some(variant);
        }
    }

    ordered.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn variant(id: i64, allocation_pct: i32, is_control: bool) -> Variant {
        Variant {
            id,
            experiment_id: 1,
            key: format!("v{}", id),
            name: format!("Variant {}", id),
            description: None,
            allocation_pct,
            is_control,
            config: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn bucket_is_deterministic() {
        let a = bucket("user_42", "demo_color", "hash-seed", DEFAULT_BUCKET_SIZE);
        let b = bucket("user_42", "demo_color", "hash-seed", DEFAULT_BUCKET_SIZE);
        assert_eq!(a, b);
        assert!(a < DEFAULT_BUCKET_SIZE);
    }

    #[test]
    fn changing_seed_reshuffles() {
        let mut moved = 0;
        for i in 0..1_000 {
            let user = format!("user_{}", i);
            let a = bucket(&user, "seed-a", "hash-seed", DEFAULT_BUCKET_SIZE);
            let b = bucket(&user, "seed-b", "hash-seed", DEFAULT_BUCKET_SIZE);
            if a != b {
                moved += 1;
            }
        }
        // A full reshuffle leaves only coincidental collisions in place.
        assert!(moved > 950, "only {} of 1000 users moved", moved);
    }

    #[test]
    fn distribution_is_uniform_within_one_percent() {
        let variants = vec![variant(1, 50, true), variant(2, 50, false)];
        let n = 10_000;
        let mut counts = [0u32; 2];

        for i in 0..n {
            let user = format!("user_{}", i);
            let b = bucket(&user, "uniformity", "hash-seed", DEFAULT_BUCKET_SIZE);
            let chosen = choose_variant(&variants, b, DEFAULT_BUCKET_SIZE).unwrap();
            counts[(chosen.id - 1) as usize] += 1;
        }

        for count in counts {
            let freq = count as f64 / n as f64;
            assert!((freq - 0.5).abs() <= 0.02, "freq {} outside tolerance", freq);
        }
    }

    #[test]
    fn allocation_ranges_are_exact_at_bucket_resolution() {
        // [33, 33, 34]: ranges are [0, 3300), [3300, 6600), [6600, 10000)
        let variants = vec![variant(1, 33, true), variant(2, 33, false), variant(3, 34, false)];

        assert_eq!(choose_variant(&variants, 0, 10_000).unwrap().id, 1);
        assert_eq!(choose_variant(&variants, 3_299, 10_000).unwrap().id, 1);
        assert_eq!(choose_variant(&variants, 3_300, 10_000).unwrap().id, 2);
        assert_eq!(choose_variant(&variants, 6_599, 10_000).unwrap().id, 2);
        assert_eq!(choose_variant(&variants, 6_600, 10_000).unwrap().id, 3);
        assert_eq!(choose_variant(&variants, 9_999, 10_000).unwrap().id, 3);
    }

    #[test]
    fn last_variant_absorbs_rounding_remainder() {
        // 33+33+33 only covers 9900 buckets; the tail falls to the last variant.
        let variants = vec![variant(1, 33, true), variant(2, 33, false), variant(3, 33, false)];

        assert_eq!(choose_variant(&variants, 9_950, 10_000).unwrap().id, 3);
    }

    #[test]
    fn selection_ignores_input_order() {
        let sorted = vec![variant(1, 33, true), variant(2, 33, false), variant(3, 34, false)];
        let shuffled = vec![variant(3, 34, false), variant(1, 33, true), variant(2, 33, false)];

        for b in [0, 1_000, 3_300, 5_000, 6_600, 9_999] {
            assert_eq!(
                choose_variant(&sorted, b, 10_000).unwrap().id,
                choose_variant(&shuffled, b, 10_000).unwrap().id,
            );
        }
    }

    #[test]
    fn empty_variant_list_yields_none() {
        assert!(choose_variant(&[], 0, 10_000).is_none());
    }

    #[test]
    fn seed_scenario_distribution() {
        // demo_color with control=33, green=33, red=34 over 1000 users.
        let variants = vec![variant(1, 33, true), variant(2, 33, false), variant(3, 34, false)];
        let mut counts = [0u32; 3];

        for i in 0..1_000 {
            let user = format!("user_{}", i);
            let b = bucket(&user, "demo_color", "hash-seed", DEFAULT_BUCKET_SIZE);
            let chosen = choose_variant(&variants, b, DEFAULT_BUCKET_SIZE).unwrap();
            counts[(chosen.id - 1) as usize] += 1;
        }

        assert!((counts[0] as i32 - 330).abs() <= 50, "control={}", counts[0]);
        assert!((counts[1] as i32 - 330).abs() <= 50, "green={}", counts[1]);
        assert!((counts[2] as i32 - 340).abs() <= 50, "red={}", counts[2]);
        assert!(counts[0] <= 550);
    }
}
