use crate::config::DeviceConf;
use crate::error::Result;
use crate::models::DeviceId;

/// Where an id sits in the preference list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMatch {
    Active,
    /// Rank 0 is the most recently retired id.
    Legacy { rank: usize },
    Unknown,
}

/// Tracks which physical id the hub listens to, plus the ids earlier hardware
/// batches reported. Legacy ids are only for diagnostics; data is never merged
/// across ids.
#[derive(Debug, Clone)]
pub struct DeviceIdentityResolver {
    active: DeviceId,
    legacy: Vec<DeviceId>,
}

impl DeviceIdentityResolver {
    pub fn new(active: DeviceId, legacy: Vec<DeviceId>) -> Self {
        let mut resolver = Self { active, legacy: Vec::new() };
        for id in legacy {
            if id != resolver.active && !resolver.legacy.contains(&id) {
                resolver.legacy.push(id);
            }
        }
        resolver
    }

    pub fn from_config(conf: &DeviceConf) -> Result<Self> {
        let active = DeviceId::new(conf.active.clone())?;
        let legacy = conf
            .legacy
            .iter()
            .map(|id| DeviceId::new(id.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(active, legacy))
    }

    pub fn resolve(&self) -> &DeviceId {
        &self.active
    }

    /// Makes `new_id` active; the old active id becomes the first legacy id.
    /// Restarting the channel is up to the caller.
    pub fn retarget(&mut self, new_id: DeviceId) {
        if new_id == self.active {
            return;
        }
        let previous = std::mem::replace(&mut self.active, new_id);
        self.legacy.retain(|id| id != &self.active && id != &previous);
        self.legacy.insert(0, previous);
    }

    pub fn legacy_ids(&self) -> &[DeviceId] {
        &self.legacy
    }

    pub fn preference(&self) -> Vec<&DeviceId> {
        std::iter::once(&self.active).chain(self.legacy.iter()).collect()
    }

    pub fn classify(&self, id: &DeviceId) -> IdentityMatch {
        if id == &self.active {
            return IdentityMatch::Active;
        }
        match self.legacy.iter().position(|legacy| legacy == id) {
            Some(rank) => IdentityMatch::Legacy { rank },
            None => IdentityMatch::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    #[test]
    fn test_resolve_and_classify() {
        let resolver = DeviceIdentityResolver::new(
            id("ESP32C3-A835B29E9EF0"),
            vec![id("ESP32C3-A835629EDEF8"), id("ESP32C3-A8358206CF8")],
        );

        assert_eq!(resolver.resolve().as_str(), "ESP32C3-A835B29E9EF0");
        assert_eq!(resolver.classify(&id("ESP32C3-A835B29E9EF0")), IdentityMatch::Active);
        assert_eq!(resolver.classify(&id("ESP32C3-A8358206CF8")), IdentityMatch::Legacy { rank: 1 });
        assert_eq!(resolver.classify(&id("ESP32C3-FFFFFFFFFFFF")), IdentityMatch::Unknown);
    }

    #[test]
    fn test_retarget_demotes_previous() {
        let mut resolver = DeviceIdentityResolver::new(id("B"), vec![id("A")]);
        resolver.retarget(id("A"));

        assert_eq!(resolver.resolve().as_str(), "A");
        let order: Vec<&str> = resolver.preference().iter().map(|d| d.as_str()).collect();
        assert_eq!(order, vec!["A", "B"]);

        // Same id again changes nothing.
        resolver.retarget(id("A"));
        assert_eq!(resolver.legacy_ids().len(), 1);
    }

    #[test]
    fn test_duplicate_legacy_ids_are_dropped() {
        let resolver = DeviceIdentityResolver::new(id("A"), vec![id("A"), id("B"), id("B")]);
        assert_eq!(resolver.legacy_ids(), &[id("B")]);
    }

    #[test]
    fn test_from_config_rejects_empty() {
        let conf = DeviceConf { active: "".into(), legacy: vec![] };
        assert!(DeviceIdentityResolver::from_config(&conf).is_err());
    }
}
