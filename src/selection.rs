//! Router filtering and guard/exit pair selection.
//!
//! # Selection Pipeline
//!
//! ```text
//!   all routers
//!       │
//!       ▼
//!   ┌──────────────────────────┐
//!   │ NodeRestrictionList      │  bandwidth >= floor, flags ⊇ required
//!   └────────────┬─────────────┘
//!                ▼
//!   ┌──────────────────────────┐
//!   │ country (optional)       │  one ip-to-country lookup per survivor
//!   └────────────┬─────────────┘
//!                ▼
//!   ┌──────────────────────────┐
//!   │ normalize port policies  │
//!   └──────┬────────────┬──────┘
//!          ▼            ▼
//!       exits         guards
//!   Exit flag and    Guard flag and
//!   covers ports     not an exit
//! ```
//!
//! A relay never appears on both sides, so the two hops of a circuit are
//! always distinct relays.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::config::{Config, LogLevel};
use crate::consensus::RouterDescriptor;
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::ports::PortRangeSet;

/// Validates that a string is a 2-letter country code (case-insensitive).
///
/// ```rust
/// use fasttor_rs::selection::is_valid_country_code;
///
/// assert!(is_valid_country_code("de"));
/// assert!(is_valid_country_code("US"));
/// assert!(!is_valid_country_code("USA"));
/// assert!(!is_valid_country_code("U1"));
/// ```
pub fn is_valid_country_code(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic())
}

/// Resolves a relay address to a country code.
///
/// [`ProtocolSession`](crate::session::ProtocolSession) implements this
/// with `GETINFO ip-to-country/<ip>`.
#[async_trait]
pub trait CountryLookup: Send {
    /// Lowercase country code for `address`, or `??` when unknown.
    async fn country_of(&mut self, address: Ipv4Addr) -> Result<String>;
}

/// A filter over router descriptors.
///
/// Restrictions are combined with [`NodeRestrictionList`]; a router must
/// pass all of them.
pub trait NodeRestriction: Send + Sync {
    /// Returns true if the router passes this restriction.
    fn r_is_ok(&self, router: &RouterDescriptor) -> bool;
}

/// Requires every listed flag.
#[derive(Debug, Clone)]
pub struct FlagsRestriction {
    pub mandatory: Vec<String>,
}

impl FlagsRestriction {
    pub fn new(mandatory: Vec<String>) -> Self {
        Self { mandatory }
    }
}

impl NodeRestriction for FlagsRestriction {
    fn r_is_ok(&self, router: &RouterDescriptor) -> bool {
        self.mandatory.iter().all(|flag| router.has_flag(flag))
    }
}

/// Requires a minimum advertised bandwidth.
#[derive(Debug, Clone, Copy)]
pub struct BandwidthRestriction {
    pub min_bandwidth: u64,
}

impl NodeRestriction for BandwidthRestriction {
    fn r_is_ok(&self, router: &RouterDescriptor) -> bool {
        router.bandwidth >= self.min_bandwidth
    }
}

/// A list of restrictions that must all pass.
pub struct NodeRestrictionList {
    restrictions: Vec<Box<dyn NodeRestriction>>,
}

impl NodeRestrictionList {
    pub fn new(restrictions: Vec<Box<dyn NodeRestriction>>) -> Self {
        Self { restrictions }
    }

    /// Returns true if the router passes all restrictions.
    pub fn r_is_ok(&self, router: &RouterDescriptor) -> bool {
        self.restrictions.iter().all(|r| r.r_is_ok(router))
    }
}

/// Operator requirements for the circuit.
///
/// # Fields
///
/// | Field | Default | Meaning |
/// |-------|---------|---------|
/// | `min_bandwidth` | none | Bandwidth floor, both hops |
/// | `flags` | Fast Valid Running | Flags required on both hops |
/// | `country` | none | Country of both hops |
/// | `ports` | `accept 80,443,1024-65535` | Ports the exit must allow |
/// | `routers` | none | Explicit `(guard, exit)` nicknames |
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    pub min_bandwidth: Option<u64>,
    pub flags: Vec<String>,
    pub country: Option<String>,
    pub ports: PortRangeSet,
    pub routers: Option<(String, String)>,
}

impl SelectionCriteria {
    /// Builds criteria from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortSpecParse`] for a bad port policy and
    /// [`Error::Config`] if the router list is not a guard/exit pair.
    pub fn from_config(config: &Config) -> Result<Self> {
        let routers = match config.routers.as_deref() {
            None => None,
            Some([guard, exit]) => Some((guard.clone(), exit.clone())),
            Some(other) => {
                return Err(Error::Config(format!(
                    "routers must name exactly a guard and an exit, got {}",
                    other.len()
                )))
            }
        };

        Ok(Self {
            min_bandwidth: config.min_bandwidth,
            flags: config.flags.clone(),
            country: config.country.as_ref().map(|c| c.to_ascii_lowercase()),
            ports: PortRangeSet::parse_policy(&config.ports)?,
            routers,
        })
    }

    fn restrictions(&self) -> NodeRestrictionList {
        let mut restrictions: Vec<Box<dyn NodeRestriction>> =
            vec![Box::new(FlagsRestriction::new(self.flags.clone()))];
        if let Some(min_bandwidth) = self.min_bandwidth {
            restrictions.push(Box::new(BandwidthRestriction { min_bandwidth }));
        }
        NodeRestrictionList::new(restrictions)
    }
}

/// Relays usable for each hop.
#[derive(Debug, Clone, Default)]
pub struct CandidateSets {
    pub guards: Vec<RouterDescriptor>,
    pub exits: Vec<RouterDescriptor>,
}

impl CandidateSets {
    /// Picks the guard and exit for a circuit.
    ///
    /// With explicit nicknames each is looked up in its own set; otherwise
    /// one of each is drawn uniformly at random.
    ///
    /// # Errors
    ///
    /// - [`Error::RouterNotFound`] if a named router is not a candidate
    /// - [`Error::NoSuitableCircuit`] if either set is empty
    pub fn choose_pair(
        &self,
        explicit: Option<&(String, String)>,
    ) -> Result<(&RouterDescriptor, &RouterDescriptor)> {
        if let Some((guard_name, exit_name)) = explicit {
            let guard = find_by_nickname(&self.guards, guard_name)?;
            let exit = find_by_nickname(&self.exits, exit_name)?;
            return Ok((guard, exit));
        }

        let mut rng = rand::thread_rng();
        match (self.guards.choose(&mut rng), self.exits.choose(&mut rng)) {
            (Some(guard), Some(exit)) => Ok((guard, exit)),
            _ => Err(self.exhausted()),
        }
    }

    fn exhausted(&self) -> Error {
        Error::NoSuitableCircuit {
            guards: self.guards.len(),
            exits: self.exits.len(),
        }
    }
}

fn find_by_nickname<'a>(
    routers: &'a [RouterDescriptor],
    nickname: &str,
) -> Result<&'a RouterDescriptor> {
    routers
        .iter()
        .find(|r| r.nickname == nickname)
        .ok_or_else(|| Error::RouterNotFound(nickname.to_string()))
}

/// Splits the router list into guard and exit candidates.
///
/// # Errors
///
/// - [`Error::NoSuitableCircuit`] if no guard or no exit remains
/// - [`Error::PortSpecParse`] if a surviving relay has a malformed policy
/// - any error from the country lookup
pub async fn select<L: CountryLookup + ?Sized>(
    routers: Vec<RouterDescriptor>,
    criteria: &SelectionCriteria,
    lookup: &mut L,
) -> Result<CandidateSets> {
    let restrictions = criteria.restrictions();
    let mut survivors: Vec<RouterDescriptor> =
        routers.into_iter().filter(|r| restrictions.r_is_ok(r)).collect();

    if let Some(country) = &criteria.country {
        let mut in_country = Vec::with_capacity(survivors.len());
        for router in survivors {
            if lookup.country_of(router.address).await? == *country {
                in_country.push(router);
            }
        }
        survivors = in_country;
    }

    let mut exits = Vec::new();
    let mut others = Vec::new();
    for mut router in survivors {
        let is_exit = router.has_flag("Exit") && router.normalize_ports()?.covers_all(&criteria.ports);
        if is_exit {
            exits.push(router);
        } else {
            others.push(router);
        }
    }

    let exit_fingerprints: HashSet<&str> = exits.iter().map(|r| r.fingerprint.as_str()).collect();
    let guards: Vec<RouterDescriptor> = others
        .into_iter()
        .filter(|r| r.has_flag("Guard") && !exit_fingerprints.contains(r.fingerprint.as_str()))
        .collect();

    plog(
        LogLevel::Notice,
        &format!("{} exits & {} guards found", exits.len(), guards.len()),
    );

    let candidates = CandidateSets { guards, exits };
    if candidates.guards.is_empty() || candidates.exits.is_empty() {
        return Err(candidates.exhausted());
    }
    Ok(candidates)
}
