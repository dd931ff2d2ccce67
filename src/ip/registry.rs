//! Subnet registry.
//!
//! Tracks every subnet handed out during planning together with its owner
//! so that overlaps are caught before anything is configured.

use ipnet::Ipv4Net;

use crate::error::PlanError;

#[derive(Debug, Default)]
pub struct SubnetRegistry {
    /// Claimed subnets in claim order, with a human-readable owner
    claimed: Vec<(Ipv4Net, String)>,
}

fn overlaps(x: &Ipv4Net, y: &Ipv4Net) -> bool {
    x.contains(&y.network()) || y.contains(&x.network())
}

impl SubnetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner of the first claimed subnet overlapping `subnet`
    pub fn overlapping(&self, subnet: &Ipv4Net) -> Option<(&Ipv4Net, &str)> {
        self.claimed
            .iter()
            .find(|(net, _)| overlaps(net, subnet))
            .map(|(net, owner)| (net, owner.as_str()))
    }

    /// Claim `subnet` for `owner`, failing on any overlap
    pub fn claim(&mut self, subnet: Ipv4Net, owner: &str) -> Result<(), PlanError> {
        let subnet = subnet.trunc();
        if let Some((existing, existing_owner)) = self.overlapping(&subnet) {
            return Err(PlanError::AddressConflict {
                subnet,
                owner: owner.to_string(),
                existing: *existing,
                existing_owner: existing_owner.to_string(),
            });
        }
        self.claimed.push((subnet, owner.to_string()));
        Ok(())
    }

    /// Claim the first `/prefix` block of `pool` that overlaps nothing claimed so far
    pub fn claim_next(&mut self, pool: Ipv4Net, prefix: u8, owner: &str) -> Result<Ipv4Net, PlanError> {
        let exhausted = || PlanError::AddressPoolExhausted {
            pool,
            prefix,
            owner: owner.to_string(),
        };
        let candidate = pool
            .trunc()
            .subnets(prefix)
            .map_err(|_| exhausted())?
            .find(|net| self.overlapping(net).is_none())
            .ok_or_else(exhausted)?;
        self.claimed.push((candidate, owner.to_string()));
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_claim_detects_overlap() {
        let mut registry = SubnetRegistry::new();
        registry.claim(net("10.0.0.0/24"), "pc0").unwrap();
        let err = registry.claim(net("10.0.0.128/25"), "pc1").unwrap_err();
        assert_eq!(
            err,
            PlanError::AddressConflict {
                subnet: net("10.0.0.128/25"),
                owner: "pc1".to_string(),
                existing: net("10.0.0.0/24"),
                existing_owner: "pc0".to_string(),
            }
        );
        // a supernet conflicts as well
        assert!(registry.claim(net("10.0.0.0/16"), "big").is_err());
        assert!(registry.claim(net("10.0.1.0/24"), "pc2").is_ok());
    }

    #[test]
    fn test_claim_next_skips_claimed_blocks() {
        let mut registry = SubnetRegistry::new();
        registry.claim(net("10.255.0.4/30"), "pinned").unwrap();
        let first = registry.claim_next(net("10.255.0.0/16"), 30, "a").unwrap();
        let second = registry.claim_next(net("10.255.0.0/16"), 30, "b").unwrap();
        assert_eq!(first, net("10.255.0.0/30"));
        assert_eq!(second, net("10.255.0.8/30"));
        assert_eq!(registry.overlapping(&net("10.255.0.8/30")), Some((&second, "b")));
    }

    #[test]
    fn test_claim_next_exhaustion() {
        let mut registry = SubnetRegistry::new();
        let pool = net("192.168.0.0/29");
        registry.claim_next(pool, 30, "a").unwrap();
        registry.claim_next(pool, 30, "b").unwrap();
        assert!(matches!(
            registry.claim_next(pool, 30, "c"),
            Err(PlanError::AddressPoolExhausted { .. })
        ));
    }
}
