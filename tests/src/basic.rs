use ove::{set_resize_policy, FindPosition, Hashset, OveError, ResizePolicy, SelfKeyed, SetType};

use crate::common::{
    keyval, live_tracked, policy_lock, seed_hash_function, KeyvalType, Tracked, TrackedType,
};

fn add_find_delete_helper(count: usize) {
    seed_hash_function();
    let mut set: Hashset<KeyvalType> = Hashset::new();

    // Add
    for j in 0..count {
        let key = j.to_string();
        let val = (count - j + 42).to_string();
        assert!(set.add(keyval(&key, &val)));
    }
    assert_eq!(set.len(), count);

    // Find
    for j in 0..count {
        let key = j.to_string();
        let val = (count - j + 42).to_string();
        let element = set.find(&key).expect("added key must be found");
        assert_eq!(element.val, val);
    }

    // Delete half of them, every third via pop
    for j in 0..count / 2 {
        let key = j.to_string();
        if j % 3 == 0 {
            let val = (count - j + 42).to_string();
            let element = set.pop(&key).expect("key to pop must be present");
            assert_eq!(element.val, val);
        } else {
            assert!(set.delete(&key));
        }
    }
    assert_eq!(set.len(), count - count / 2);

    // Delete the remaining elements through clear, with a progress callback.
    let mut progress_calls = 0;
    set.clear_with(|| progress_calls += 1);
    assert!(progress_calls > 0);
    assert_eq!(set.len(), 0);
}

#[test]
fn add_find_delete() {
    let _guard = policy_lock();
    add_find_delete_helper(200);
}

#[test]
fn add_find_delete_avoid_resize() {
    let _guard = policy_lock();
    set_resize_policy(ResizePolicy::Avoid);
    add_find_delete_helper(200);
    set_resize_policy(ResizePolicy::Allow);
}

/// Pointer-sized integer elements with resizes running to completion inside
/// the triggering call.
enum InstantSelfKeyed {}

impl SetType for InstantSelfKeyed {
    type Element = u64;
    type Key = u64;

    fn key(element: &u64) -> &u64 {
        element
    }

    fn hash(key: &u64) -> u64 {
        ove::hash_bytes(&key.to_le_bytes())
    }

    fn key_eq(a: &u64, b: &u64) -> bool {
        a == b
    }

    const INSTANT_REHASHING: bool = true;
}

#[test]
fn instant_rehashing() {
    seed_hash_function();
    let mut set: Hashset<InstantSelfKeyed> = Hashset::new();

    for j in 0..200u64 {
        assert!(set.add(j));
        assert!(!set.is_rehashing());
    }
    for j in 0..200u64 {
        assert!(set.delete(&j));
        assert!(!set.is_rehashing());
    }
    assert!(set.is_empty());
}

#[test]
fn bucket_chain_length() {
    seed_hash_function();
    let _guard = policy_lock();
    let count = 1_000_000u64;
    let mut set: Hashset<SelfKeyed<u64>> = Hashset::new();

    let mut j = 0u64;
    while j < count {
        assert!(set.add(j));
        j += 1;
    }
    // If it's rehashing, add a few more until rehashing is complete.
    while set.is_rehashing() {
        assert!(set.add(j));
        j += 1;
        assert!(j < count * 2);
    }
    let chain_not_rehashing = set.longest_bucket_chain();
    assert!(
        chain_not_rehashing < 10,
        "longest chain {} after rehash settled",
        chain_not_rehashing
    );

    // Add more until rehashing starts again.
    while !set.is_rehashing() {
        assert!(set.add(j));
        j += 1;
        assert!(j < count * 2);
    }
    let chain_rehashing = set.longest_bucket_chain();
    assert!(
        chain_rehashing < 10,
        "longest chain {} at the grow trigger",
        chain_rehashing
    );
}

#[test]
fn delete_removes_exactly_one() {
    seed_hash_function();
    let mut set: Hashset<SelfKeyed<u64>> = Hashset::new();
    for j in 0..100u64 {
        assert!(set.add(j));
    }
    assert!(set.delete(&42));
    assert_eq!(set.len(), 99);
    assert!(set.find(&42).is_none());
    for j in (0..100u64).filter(|&j| j != 42) {
        assert_eq!(set.find(&j), Some(&j));
    }
    assert!(!set.delete(&42));
}

#[test]
fn two_phase_insert_and_pop() {
    seed_hash_function();
    let count = 200usize;
    let mut set: Hashset<KeyvalType> = Hashset::new();

    // find_position_for_insert + Position::insert
    for j in 0..count {
        let key = j.to_string();
        let val = (count - j + 42).to_string();
        match set.find_position_for_insert(&key) {
            FindPosition::Vacant(position) => position.insert(keyval(&key, &val)),
            FindPosition::Existing(_) => panic!("key {} cannot be present yet", key),
        }
    }
    assert_eq!(set.len(), count);

    // Check that all elements were inserted.
    for j in 0..count {
        let key = j.to_string();
        let val = (count - j + 42).to_string();
        assert_eq!(set.find(&key).expect("inserted key").val, val);
    }

    // Two-phase pop, size unchanged between the phases.
    for j in 0..count {
        let key = j.to_string();
        let val = (count - j + 42).to_string();
        let size_before = set.len();
        let pending = set.two_phase_pop_find(&key).expect("key must be present");
        assert_eq!(pending.element().val, val);
        assert_eq!(pending.set().len(), size_before);
        let element = pending.delete();
        assert_eq!(element.val, val);
        assert_eq!(set.len(), size_before - 1);
    }
    assert!(set.is_empty());
}

#[test]
fn two_phase_insert_finds_existing() {
    seed_hash_function();
    let mut set: Hashset<KeyvalType> = Hashset::new();
    assert!(set.add(keyval("a", "1")));
    match set.find_position_for_insert("a") {
        FindPosition::Existing(element) => assert_eq!(element.val, "1"),
        FindPosition::Vacant(_) => panic!("existing key reported vacant"),
    }
    // An abandoned vacant position must leave the set intact.
    match set.find_position_for_insert("b") {
        FindPosition::Vacant(position) => drop(position),
        FindPosition::Existing(_) => panic!("absent key reported existing"),
    }
    assert_eq!(set.len(), 1);
    assert!(set.add(keyval("b", "2")));
    assert_eq!(set.len(), 2);
}

#[test]
fn replace_keeps_one_element_per_key() {
    seed_hash_function();
    let mut set: Hashset<KeyvalType> = Hashset::new();
    assert!(set.replace(keyval("k", "old")).is_none());
    let old = set.replace(keyval("k", "new")).expect("key was present");
    assert_eq!(old.val, "old");
    assert_eq!(set.len(), 1);
    assert_eq!(set.find("k").expect("key").val, "new");
    // add never overwrites
    assert!(!set.add(keyval("k", "other")));
    assert_eq!(set.find("k").expect("key").val, "new");
}

#[test]
fn all_elements_destroyed() {
    seed_hash_function();
    let mut set: Hashset<TrackedType> = Hashset::new();
    for j in 0..500 {
        assert!(set.add(Tracked::new(j)));
    }
    assert_eq!(live_tracked(), 500);

    for j in 0..100 {
        assert!(set.delete(&j));
    }
    assert_eq!(live_tracked(), 400);

    let popped = set.pop(&100).expect("present");
    assert_eq!(live_tracked(), 400);
    drop(popped);
    assert_eq!(live_tracked(), 399);

    set.clear();
    assert_eq!(live_tracked(), 0);

    for j in 0..100 {
        assert!(set.add(Tracked::new(j)));
    }
    assert_eq!(live_tracked(), 100);
    drop(set);
    assert_eq!(live_tracked(), 0);
}

#[test]
fn try_expand_reports_capacity_overflow() {
    let mut set: Hashset<SelfKeyed<u64>> = Hashset::new();
    match set.try_expand(usize::MAX) {
        Err(OveError::CapacityOverflow(_)) => {}
        other => panic!("expected capacity overflow, got {:?}", other),
    }
}

#[test]
fn expand_prevents_rehashing() {
    seed_hash_function();
    let mut set: Hashset<SelfKeyed<u64>> = Hashset::new();
    assert!(set.expand(1000));
    let capacity = set.capacity();
    for j in 0..1000u64 {
        assert!(set.add(j));
        assert!(!set.is_rehashing());
    }
    assert_eq!(set.capacity(), capacity);
}

#[test]
fn auto_shrink_can_be_paused() {
    seed_hash_function();
    let _guard = policy_lock();
    let mut set: Hashset<SelfKeyed<u64>> = Hashset::new();
    set.expand(1000);
    for j in 0..1000u64 {
        assert!(set.add(j));
    }
    let capacity = set.capacity();

    set.pause_auto_shrink();
    for j in 0..1000u64 {
        assert!(set.delete(&j));
    }
    // No shrink while paused.
    assert_eq!(set.capacity(), capacity);
    assert!(!set.is_rehashing());

    // The deferred shrink kicks in on resume.
    set.resume_auto_shrink();
    assert!(set.is_rehashing() || set.capacity() < capacity);
}
