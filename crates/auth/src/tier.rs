//! Tenant hierarchy: tiers, teams and the predicates built on them.

use serde::{Deserialize, Serialize};

use tessera_core::TeamId;

use crate::error::AuthError;

/// Authorization tier of a team.
///
/// Variants are declared lowest first so the derived `Ord` gives
/// `Super > Maintenance > Customer`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    Customer,
    Maintenance,
    Super,
}

impl TenantTier {
    pub const ALL: [TenantTier; 3] = [TenantTier::Customer, TenantTier::Maintenance, TenantTier::Super];

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantTier::Customer => "customer",
            TenantTier::Maintenance => "maintenance",
            TenantTier::Super => "super",
        }
    }
}

impl core::fmt::Display for TenantTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A team (tenant) with its tier and the inclusive range of member positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub tier: TenantTier,
    pub min_position: i32,
    pub max_position: i32,
}

impl Team {
    pub fn new(
        id: TeamId,
        name: impl Into<String>,
        tier: TenantTier,
        min_position: i32,
        max_position: i32,
    ) -> Result<Self, AuthError> {
        if min_position > max_position {
            return Err(AuthError::validation(
                "position_range",
                format!("min position {min_position} exceeds max position {max_position}"),
            ));
        }
        Ok(Self {
            id,
            name: name.into(),
            tier,
            min_position,
            max_position,
        })
    }

    /// Whether `position` is a valid member rank in this team.
    pub fn admits(&self, position: i32) -> bool {
        (self.min_position..=self.max_position).contains(&position)
    }
}

/// Anything that sits at a tier and may lead its team.
///
/// Implemented by the resolved [`crate::Principal`] and by the per-request
/// [`crate::PrincipalContext`], so tier logic is written exactly once.
pub trait TierMember {
    fn tier(&self) -> TenantTier;

    fn is_leader(&self) -> bool;

    /// `tier >= required`. Super satisfies every lower minimum.
    fn tier_at_least(&self, required: TenantTier) -> bool {
        self.tier() >= required
    }

    /// Leader of a team at exactly `tier`.
    fn is_leader_of(&self, tier: TenantTier) -> bool {
        self.is_leader() && self.tier() == tier
    }

    /// Leader of a team at `tier` or above.
    fn is_leader_at_least(&self, tier: TenantTier) -> bool {
        self.is_leader() && self.tier_at_least(tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Member {
        tier: TenantTier,
        leader: bool,
    }

    impl TierMember for Member {
        fn tier(&self) -> TenantTier {
            self.tier
        }

        fn is_leader(&self) -> bool {
            self.leader
        }
    }

    fn any_tier() -> impl Strategy<Value = TenantTier> {
        prop_oneof![
            Just(TenantTier::Customer),
            Just(TenantTier::Maintenance),
            Just(TenantTier::Super),
        ]
    }

    #[test]
    fn tiers_are_totally_ordered() {
        assert!(TenantTier::Super > TenantTier::Maintenance);
        assert!(TenantTier::Maintenance > TenantTier::Customer);
    }

    #[test]
    fn team_rejects_inverted_range() {
        let err = Team::new(TeamId::new(), "Acme", TenantTier::Customer, 5, 1).unwrap_err();
        assert!(matches!(err, AuthError::Validation { field: "position_range", .. }));
    }

    #[test]
    fn team_range_is_inclusive() {
        let team = Team::new(TeamId::new(), "Acme", TenantTier::Customer, 1, 5).unwrap();
        assert!(team.admits(1));
        assert!(team.admits(5));
        assert!(!team.admits(0));
        assert!(!team.admits(6));
    }

    #[test]
    fn leader_of_requires_exact_tier() {
        let m = Member {
            tier: TenantTier::Super,
            leader: true,
        };
        assert!(m.is_leader_of(TenantTier::Super));
        assert!(!m.is_leader_of(TenantTier::Maintenance));
        assert!(m.is_leader_at_least(TenantTier::Maintenance));
    }

    proptest! {
        #[test]
        fn tier_minimum_is_monotone(tier in any_tier(), leader in any::<bool>()) {
            let m = Member { tier, leader };
            if m.tier_at_least(TenantTier::Super) {
                prop_assert!(m.tier_at_least(TenantTier::Maintenance));
            }
            if m.tier_at_least(TenantTier::Maintenance) {
                prop_assert!(m.tier_at_least(TenantTier::Customer));
            }
            prop_assert!(m.tier_at_least(TenantTier::Customer));
        }

        #[test]
        fn non_leaders_lead_nothing(tier in any_tier(), target in any_tier()) {
            let m = Member { tier, leader: false };
            prop_assert!(!m.is_leader_of(target));
            prop_assert!(!m.is_leader_at_least(target));
        }
    }
}
