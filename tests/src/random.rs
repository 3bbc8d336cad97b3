use rand::Rng;

use ove::{Hashset, SelfKeyed, SetType};

use crate::common::seed_hash_function;

#[test]
fn fair_random_element_is_fair() {
    seed_hash_function();
    let count = 400usize;
    let rounds = 10_000usize;

    let mut set: Hashset<SelfKeyed<u64>> = Hashset::new();
    for j in 0..count {
        assert!(set.add(j as u64));
    }

    let mut times_picked = vec![0u32; count];
    for _ in 0..rounds {
        let &element = set.fair_random_element().expect("set is not empty");
        times_picked[element as usize] += 1;
    }

    // Picking one of m elements n times is binomial per element:
    // E(Y) = n/m, Var(Y) = n * (m - 1) / (m * m). With n/m >= 5 the normal
    // approximation holds and ~99.7% of elements should fall within three
    // standard deviations; require a conservative 60%.
    let m = count as f64;
    let n = rounds as f64;
    assert!(n / m >= 5.0);
    let expected = n / m;
    let std_dev = (n * (m - 1.0) / (m * m)).sqrt();
    let within_3_dev = times_picked
        .iter()
        .filter(|&&picked| {
            let dev = expected - picked as f64;
            dev >= -3.0 * std_dev && dev <= 3.0 * std_dev
        })
        .count();
    let p99 = 100.0 * within_3_dev as f64 / m;
    assert!(p99 >= 60.0, "too unfair randomness: p99 = {:.2}%", p99);
}

/// Elements with a controlled hash value, so a probe chain of arbitrary
/// length can be constructed. Keys compare by identity: distinct elements
/// never collide, even with equal hashes.
pub struct MockHashElement {
    pub value: u64,
    pub hash: u64,
}

enum MockHashType {}

impl SetType for MockHashType {
    type Element = Box<MockHashElement>;
    type Key = MockHashElement;

    fn key(element: &Box<MockHashElement>) -> &MockHashElement {
        element
    }

    fn hash(key: &MockHashElement) -> u64 {
        if key.hash != 0 {
            key.hash
        } else {
            key.value
        }
    }

    fn key_eq(a: &MockHashElement, b: &MockHashElement) -> bool {
        std::ptr::eq(a, b)
    }
}

#[test]
fn fair_random_element_with_long_chain() {
    seed_hash_function();

    let num_chained = 64usize;
    let num_random = 448usize;
    let p_fair = num_chained as f64 / (num_chained + num_random) as f64;

    // Estimator of true probability: sample count for a measurement within
    // `precision` of the truth at five-sigma confidence.
    let precision = 0.01;
    let acceptable_deviation = 0.015;
    let z = 5.0;
    let num_samples = (p_fair * (1.0 - p_fair) * z * z / (precision * precision)) as usize + 1;

    let mut rng = rand::thread_rng();
    let mut set: Hashset<MockHashType> = Hashset::new();
    set.expand(num_chained + num_random);

    let chain_hash: u64 = rng.gen_range(1, u64::max_value());

    for _ in 0..num_random {
        let mut hash: u64 = rng.gen_range(1, u64::max_value());
        if hash == chain_hash {
            hash += 1;
        }
        assert!(set.add(Box::new(MockHashElement { value: 0, hash })));
    }
    for i in 0..num_chained {
        assert!(set.add(Box::new(MockHashElement {
            value: i as u64,
            hash: chain_hash,
        })));
    }
    assert!(!set.is_rehashing());
    assert!(set.longest_bucket_chain() >= num_chained / 7);

    let mut chained_picked = 0usize;
    for _ in 0..num_samples {
        let element = set.fair_random_element().expect("set is not empty");
        if element.hash == chain_hash {
            chained_picked += 1;
        }
    }

    let measured = chained_picked as f64 / num_samples as f64;
    let deviation = (measured - p_fair).abs();
    assert!(
        deviation <= precision + acceptable_deviation,
        "chained elements picked with probability {:.3}, expected {:.3}",
        measured,
        p_fair
    );
}
