use std::collections::HashSet;

use proptest::prelude::*;
use trawl_endpoint::{Endpoint, HashRing};

const PROPTEST_CASES: u32 = 64;

fn arb_endpoints() -> impl Strategy<Value = Vec<String>> {
    prop::collection::hash_set("[a-z]{1,8}:[0-9]{2,4}", 1..12)
        .prop_map(|set| set.into_iter().collect())
}

fn keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("github.com/org/repo-{i}@{i:040x}")).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(PROPTEST_CASES))]

    #[test]
    fn get_is_deterministic_and_matches_get_n(endpoints in arb_endpoints(), key in "[a-z/@0-9]{1,40}") {
        let ring = HashRing::new(endpoints.clone());
        let mut reversed = endpoints;
        reversed.reverse();
        let other = HashRing::new(reversed);

        let owner = ring.get(&key).unwrap();
        prop_assert_eq!(&owner, &other.get(&key).unwrap());
        prop_assert_eq!(&ring.get_n(&key, 1).unwrap()[0], &owner);
    }

    #[test]
    fn get_n_is_distinct_and_clamped(endpoints in arb_endpoints(), n in 0usize..20) {
        let ring = HashRing::new(endpoints.clone());
        let picked = ring.get_n("repo@sha", n).unwrap();
        prop_assert_eq!(picked.len(), n.min(endpoints.len()));
        let distinct: HashSet<&Endpoint> = picked.iter().collect();
        prop_assert_eq!(distinct.len(), picked.len());
    }

    #[test]
    fn adding_an_endpoint_only_moves_keys_to_it(endpoints in arb_endpoints()) {
        let before = HashRing::new(endpoints.clone());
        let added = Endpoint::new("new-replica:9999");
        let mut grown = endpoints.clone();
        grown.push(added.as_str().to_owned());
        let after = HashRing::new(grown);

        let keys = keys(2000);
        let mut moved = 0usize;
        for key in &keys {
            let old = before.get(key).unwrap();
            let new = after.get(key).unwrap();
            if old != new {
                prop_assert_eq!(&new, &added);
                moved += 1;
            }
        }
        let expected = keys.len() as f64 / (endpoints.len() + 1) as f64;
        // Generous slack for sampling noise on small rings.
        prop_assert!((moved as f64) <= expected * 1.5 + 60.0, "moved {} of {}", moved, keys.len());
    }
}
