//! Property-based tests for the page pool.
//!
//! These check the allocator's conservation and duality invariants over
//! arbitrary allocate/release interleavings, not just the hand-picked cases
//! in the unit tests.

use proptest::prelude::*;

use pageflow_engine::PagePool;

const POOL_SIZE: usize = 24;

fn pool() -> PagePool {
    PagePool::new(POOL_SIZE, 2, 8).unwrap()
}

proptest! {
    // Conservation: allocating K pages and releasing them in an arbitrary
    // permutation restores the pool exactly.
    #[test]
    fn prop_release_order_is_irrelevant(
        k in 1..=POOL_SIZE,
        order in prop::collection::vec(any::<usize>(), POOL_SIZE),
    ) {
        let pool = pool();
        let mut held: Vec<u32> = (0..k).map(|_| pool.allocate().unwrap()).collect();
        prop_assert_eq!(pool.num_free(), POOL_SIZE - k);

        // Fisher-Yates driven by the generated indices.
        for i in (1..held.len()).rev() {
            held.swap(i, order[i] % (i + 1));
        }
        for id in held {
            pool.release(id).unwrap();
        }
        prop_assert_eq!(pool.num_free(), POOL_SIZE);
    }

    // No double allocation: every id handed out while held is distinct, and
    // each allocated page's ref count is exactly one.
    #[test]
    fn prop_held_pages_are_distinct(steps in prop::collection::vec(any::<bool>(), 1..200)) {
        let pool = pool();
        let mut held: Vec<u32> = Vec::new();

        for allocate in steps {
            if allocate {
                if let Some(id) = pool.allocate() {
                    prop_assert!(!held.contains(&id), "page {} allocated twice", id);
                    prop_assert_eq!(pool.page(id).unwrap().ref_count(), 1);
                    held.push(id);
                }
            } else if let Some(id) = held.pop() {
                pool.release(id).unwrap();
            }
            // Conservation at every step: free + held == capacity.
            prop_assert_eq!(pool.num_free() + held.len(), POOL_SIZE);
        }
    }

    // Free-stack / ref-count duality: a released page is allocatable again,
    // a held page never is.
    #[test]
    fn prop_duality_after_churn(seed in any::<u64>()) {
        let pool = pool();
        let mut held: Vec<u32> = Vec::new();
        let mut state = seed;

        for _ in 0..100 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            if state % 3 != 0 || held.is_empty() {
                if let Some(id) = pool.allocate() {
                    held.push(id);
                }
            } else {
                let idx = (state as usize / 3) % held.len();
                let id = held.swap_remove(idx);
                pool.release(id).unwrap();
            }
        }

        // Everything still held has ref_count >= 1; draining the pool then
        // releasing everything restores it.
        for &id in &held {
            prop_assert!(pool.page(id).unwrap().ref_count() >= 1);
        }
        while let Some(id) = pool.allocate() {
            held.push(id);
        }
        prop_assert_eq!(held.len(), POOL_SIZE);
        for id in held {
            pool.release(id).unwrap();
        }
        prop_assert_eq!(pool.num_free(), POOL_SIZE);
    }
}
