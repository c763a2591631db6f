use parasol_engine::{relay_probability, should_relay};
use rand_core::{OsRng, RngCore};

fn roll() -> f64 {
    (OsRng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
}

#[test]
fn unconditional_gates_ignore_the_roll() {
    for _ in 0..1_000 {
        assert!(should_relay(4, 10_000, roll()), "four hops left always goes");
        assert!(should_relay(7, 500, roll()));
        assert!(should_relay(0, 3, roll()), "tiny mesh always goes");
        assert!(should_relay(1, 0, roll()));
    }
}

#[test]
fn flooded_mesh_settles_near_forty_percent() {
    let samples = 20_000;
    let relayed = (0..samples)
        .filter(|_| should_relay(1, 150, roll()))
        .count();
    let rate = relayed as f64 / samples as f64;
    assert!(
        (0.35..0.45).contains(&rate),
        "relay rate {rate} outside the 40% band"
    );
}

#[test]
fn mid_size_mesh_settles_near_eighty_five_percent() {
    let samples = 20_000;
    let relayed = (0..samples)
        .filter(|_| should_relay(2, 20, roll()))
        .count();
    let rate = relayed as f64 / samples as f64;
    assert!(
        (0.80..0.90).contains(&rate),
        "relay rate {rate} outside the 85% band"
    );
}

#[test]
fn probability_tiers_step_down_with_mesh_size() {
    let mut last = f64::INFINITY;
    for size in [5, 20, 40, 80, 200] {
        let p = relay_probability(size);
        assert!(p < last, "tiers must strictly step down");
        last = p;
    }
    assert_eq!(relay_probability(usize::MAX), 0.4);
}
