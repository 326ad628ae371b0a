//! Violation Potential scoring laws.

use std::collections::BTreeMap;

use sentinel::metrics::{calculate_vp, overflow_ratio, vp_breakdown, StabilityEnvelope, TraitVector};

fn vector(entries: &[(&str, f64)]) -> TraitVector {
    entries.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
}

#[test]
fn inside_envelope_ratio_is_distance_over_width() {
    // ideal 5 in [0, 10]: actual 8 is 3/10 away, no overflow.
    let ratio = overflow_ratio(8.0, 5.0, 0.0, 10.0);
    assert!((ratio - 0.3).abs() < 1e-12);
}

#[test]
fn overflow_adds_excess_beyond_bound() {
    // actual 12: base |12-5|/10 = 0.7, extra (12-10)/10 = 0.2.
    let ratio = overflow_ratio(12.0, 5.0, 0.0, 10.0);
    assert!((ratio - 0.9).abs() < 1e-12);

    // below: actual -4: base 9/10, extra 4/10.
    let ratio = overflow_ratio(-4.0, 5.0, 0.0, 10.0);
    assert!((ratio - 1.3).abs() < 1e-12);
}

#[test]
fn ratio_is_monotone_in_distance_outside_envelope() {
    let mut previous = overflow_ratio(10.0, 5.0, 0.0, 10.0);
    for step in 1..50 {
        let actual = 10.0 + f64::from(step) * 0.5;
        let ratio = overflow_ratio(actual, 5.0, 0.0, 10.0);
        assert!(ratio >= previous, "ratio decreased at {actual}");
        previous = ratio;
    }

    let mut previous = overflow_ratio(0.0, 5.0, 0.0, 10.0);
    for step in 1..50 {
        let actual = -f64::from(step) * 0.5;
        let ratio = overflow_ratio(actual, 5.0, 0.0, 10.0);
        assert!(ratio >= previous, "ratio decreased at {actual}");
        previous = ratio;
    }
}

#[test]
fn exact_trait_is_zero_at_ideal_and_one_otherwise() {
    assert_eq!(overflow_ratio(1.0, 1.0, 1.0, 1.0), 0.0);
    assert_eq!(overflow_ratio(1.000_001, 1.0, 1.0, 1.0), 1.0);
    assert_eq!(overflow_ratio(0.0, 1.0, 1.0, 1.0), 1.0);
    assert_eq!(overflow_ratio(1e9, 1.0, 1.0, 1.0), 1.0);
}

#[test]
fn traits_missing_from_actual_are_not_penalized() {
    let envelope = StabilityEnvelope::from_bounds([("speed_ms", 0.0, 10.0), ("memory_mb", 0.0, 2.0)])
        .expect("valid envelope");
    let center = BTreeMap::from([("speed_ms".to_owned(), 0.0)]);
    let actual = vector(&[("speed_ms", 5.0)]);

    let breakdown = vp_breakdown(&actual, &center, &envelope, None);
    assert_eq!(breakdown.parts.len(), 1);
    assert!((breakdown.total - 0.5).abs() < 1e-12);
}

#[test]
fn traits_outside_envelope_are_ignored() {
    let envelope = StabilityEnvelope::from_bounds([("speed_ms", 0.0, 10.0)]).expect("valid");
    let center = BTreeMap::new();
    let actual = vector(&[("speed_ms", 0.0), ("unknown_trait", 1e12)]);
    assert_eq!(calculate_vp(&actual, &center, &envelope, None), 0.0);
}

#[test]
fn missing_center_entry_means_ideal_zero() {
    let envelope = StabilityEnvelope::from_bounds([("speed_ms", 0.0, 10.0)]).expect("valid");
    let actual = vector(&[("speed_ms", 4.0)]);
    let vp = calculate_vp(&actual, &BTreeMap::new(), &envelope, None);
    assert!((vp - 0.4).abs() < 1e-12);
}

#[test]
fn weights_scale_each_contribution() {
    let envelope = StabilityEnvelope::from_bounds([("speed_ms", 0.0, 10.0), ("memory_mb", 0.0, 2.0)])
        .expect("valid");
    let center = BTreeMap::new();
    let actual = vector(&[("speed_ms", 5.0), ("memory_mb", 1.0)]);
    let weights = BTreeMap::from([("speed_ms".to_owned(), 2.0)]);

    // speed 0.5 * 2 + memory 0.5 * 1 (default weight)
    let vp = calculate_vp(&actual, &center, &envelope, Some(&weights));
    assert!((vp - 1.5).abs() < 1e-12);
}

#[test]
fn vp_is_bit_reproducible() {
    let envelope = StabilityEnvelope::from_bounds([
        ("speed_ms", 0.1, 10.3),
        ("memory_mb", 0.0, 2.7),
        ("reliability", 1.0, 1.0),
    ])
    .expect("valid");
    let center = BTreeMap::from([
        ("speed_ms".to_owned(), 0.3),
        ("memory_mb".to_owned(), 0.7),
        ("reliability".to_owned(), 1.0),
    ]);
    let actual = vector(&[("speed_ms", 7.77), ("memory_mb", 3.1), ("reliability", 1.0)]);

    let first = calculate_vp(&actual, &center, &envelope, None);
    let second = calculate_vp(&actual.clone(), &center.clone(), &envelope.clone(), None);
    assert_eq!(first.to_bits(), second.to_bits());
}

#[test]
fn certification_scenario_stays_below_threshold() {
    let envelope = StabilityEnvelope::from_bounds([
        ("speed_ms", 0.0, 10.0),
        ("memory_mb", 0.0, 2.0),
        ("reliability", 1.0, 1.0),
    ])
    .expect("valid");
    let center = BTreeMap::from([
        ("speed_ms".to_owned(), 0.0),
        ("memory_mb".to_owned(), 0.0),
        ("reliability".to_owned(), 1.0),
    ]);
    // 1 MB = 10^6 bytes, reported in mebibytes.
    let one_megabyte = 1_000_000.0 / (1024.0 * 1024.0);
    let actual = vector(&[("speed_ms", 5.0), ("memory_mb", one_megabyte), ("reliability", 1.0)]);

    let vp = calculate_vp(&actual, &center, &envelope, None);
    assert!(vp < 1.0, "vp {vp} should be below threshold");
    assert!(vp > 0.9);
}

#[test]
fn vp_exactly_at_threshold_is_reported_unrounded() {
    let envelope = StabilityEnvelope::from_bounds([("speed_ms", 0.0, 10.0), ("memory_mb", 0.0, 2.0)])
        .expect("valid");
    let actual = vector(&[("speed_ms", 5.0), ("memory_mb", 1.0)]);
    let breakdown = vp_breakdown(&actual, &BTreeMap::new(), &envelope, None);
    assert_eq!(breakdown.total, 1.0);
    assert_eq!(breakdown.parts[0].name, "memory_mb");
    assert_eq!(breakdown.parts[1].name, "speed_ms");
}
