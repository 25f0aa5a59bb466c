//! Algebraic laws of the region/chain machinery that the aliasing
//! analysis relies on. Each law is stated once deterministically and
//! once over randomized regions.

use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

use faraday::region::{Chain, Chains, Link, RegMap, Region};

fn region_1d(lo: usize, up: usize) -> Region {
    Region::new(vec![lo], vec![up])
}

#[test]
fn intersection_with_self_is_identity() {
    let r = Region::new(vec![2, 0], vec![5, 4]);
    assert_eq!(r.intersect(&r), r);
}

#[test]
fn intersection_of_disjoint_regions_is_empty() {
    let a = region_1d(0, 3);
    let b = region_1d(5, 9);
    assert!(a.intersect(&b).is_empty());
    assert!(b.intersect(&a).is_empty());
}

#[test]
fn contains_agrees_with_intersection() {
    let outer = region_1d(1, 8);
    let inner = region_1d(3, 6);
    assert!(outer.contains(&inner));
    assert_eq!(outer.intersect(&inner), inner);
    assert!(!inner.contains(&outer));
}

#[test]
fn slice_style_translate_round_trips_through_its_window() {
    // Forward: source coordinates [2, 7) land at [0, 5) of the view.
    let fwd = Chain::new(Link::new(
        region_1d(2, 7),
        RegMap::Translate {
            offset: vec![-2],
            target: vec![5],
        },
    ));
    // Backward: view coordinates shift back into the source.
    let bwd = Chain::new(Link::new(
        Region::full(&[5]),
        RegMap::Translate {
            offset: vec![2],
            target: vec![10],
        },
    ));

    let inside = region_1d(3, 6);
    let there_and_back = fwd.then(&bwd).apply(&inside);
    assert_eq!(there_and_back, inside);

    // A region outside the slice window never reaches the view.
    let outside = region_1d(7, 10);
    assert!(fwd.apply(&outside).is_empty());
}

#[test]
fn a_chain_through_an_empty_filter_is_untraversable() {
    let blocked = Chain::new(Link::new(Region::empty(1), RegMap::Identity));
    assert!(blocked.untraversable());
    assert!(blocked.apply(&region_1d(0, 4)).is_empty());
}

#[test]
fn parallel_chains_union_their_images() {
    let left = Chains::single(Chain::new(Link::new(
        region_1d(0, 2),
        RegMap::Identity,
    )));
    let right = Chains::single(Chain::new(Link::new(
        region_1d(2, 4),
        RegMap::Identity,
    )));
    let both = left.parallel(&right);
    let images = both.apply(&Region::full(&[4]));
    assert!(images.contains(&region_1d(0, 2)));
    assert!(images.contains(&region_1d(2, 4)));
}

#[test]
fn series_composition_applies_left_then_right() {
    let first = Chains::single(Chain::new(Link::new(
        region_1d(0, 6),
        RegMap::Translate {
            offset: vec![0],
            target: vec![6],
        },
    )));
    let second = Chains::single(Chain::new(Link::new(
        region_1d(0, 3),
        RegMap::Identity,
    )));
    let composed = first.series(&second);
    let images = composed.apply(&Region::full(&[8]));
    assert_eq!(images, vec![region_1d(0, 3)]);
}

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn intersection_is_commutative_and_shrinking(
        a_lo in 0usize..12, a_len in 0usize..12,
        b_lo in 0usize..12, b_len in 0usize..12,
    ) {
        let a = Region::new(vec![a_lo], vec![a_lo + a_len]);
        let b = Region::new(vec![b_lo], vec![b_lo + b_len]);
        let ab = a.intersect(&b);
        prop_assert_eq!(&ab, &b.intersect(&a));
        prop_assert!(ab.nelms() <= a.nelms());
        prop_assert!(ab.nelms() <= b.nelms());
        prop_assert!(a.contains(&ab));
    }

    #[test]
    fn translate_never_escapes_the_target(
        lo in 0usize..10, len in 1usize..10,
        offset in -10i64..10, dim in 1usize..16,
    ) {
        let map = RegMap::Translate { offset: vec![offset], target: vec![dim] };
        let image = map.apply(&Region::new(vec![lo], vec![lo + len]));
        if !image.is_empty() {
            prop_assert!(image.upper()[0] <= dim);
        }
    }

    #[test]
    fn filtering_before_mapping_never_grows_the_image(
        f_lo in 0usize..8, f_len in 1usize..8,
        r_lo in 0usize..8, r_len in 1usize..8,
    ) {
        let filter = Region::new(vec![f_lo], vec![f_lo + f_len]);
        let link = Link::new(filter.clone(), RegMap::Identity);
        let image = link.apply(&Region::new(vec![r_lo], vec![r_lo + r_len]));
        prop_assert!(filter.contains(&image));
    }
}
