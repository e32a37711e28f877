use std::collections::BTreeMap;
use std::sync::Arc;

use super::channel::Channel;
use super::channel_kind::{ChannelKind, SensorTable};
use super::device::SyncOptions;
use super::devices::{bioplux::Bioplux, generic::GenericDevice, melomind::Melomind, unicorn::Unicorn};
use super::loader::{DataLoader, TextLoader};
use crate::error::{Error, Result};

/// Namespace of the built-in device kinds
pub const DEFAULT_LOCATION: &str = "biosync::devices";

/// Alternative class names resolving to a built-in kind
pub const ALIASES: &[(&str, &str)] = &[("OpenSignals", "Bioplux"), ("Plux", "Bioplux")];

/// Class-level behavior of a device family.
///
/// Implementors describe the default layout of a device (name and
/// channels), how raw sensor labels map to channel kinds, and how recorded
/// files are parsed.
pub trait DeviceKind: Send + Sync + 'static {
    fn class_name(&self) -> &'static str;

    fn default_name(&self) -> &'static str {
        self.class_name()
    }

    /// Fresh prototype channels of this device family
    fn default_channels(&self) -> Result<Vec<Channel>> {
        Ok(Vec::new())
    }

    fn sensor_table(&self) -> SensorTable {
        ChannelKind::identity_table()
    }

    fn default_sync(&self) -> SyncOptions {
        SyncOptions::default()
    }

    fn loader(&self) -> Box<dyn DataLoader> {
        Box::new(TextLoader)
    }
}

/// Factory function type for creating device kinds
pub type DeviceKindFactory = fn() -> Arc<dyn DeviceKind>;

/// A device kind made discoverable under a location namespace
pub struct DeviceKindRegistration {
    pub location: &'static str,
    pub factory: DeviceKindFactory,
}

// Inventory submission type
inventory::collect!(DeviceKindRegistration);

/// Registry of available device classes keyed by `(location, class name)`
pub struct DeviceRegistry {
    kinds: BTreeMap<(String, String), DeviceKindFactory>,
    aliases: BTreeMap<String, String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            kinds: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    /// Registry holding the built-in kinds and their aliases
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_LOCATION, || Arc::new(GenericDevice));
        registry.register(DEFAULT_LOCATION, || Arc::new(Bioplux));
        registry.register(DEFAULT_LOCATION, || Arc::new(Unicorn));
        registry.register(DEFAULT_LOCATION, || Arc::new(Melomind));
        for (alias, class) in ALIASES {
            registry.register_alias(alias, class);
        }
        registry
    }

    /// Built-in kinds plus every kind submitted through `inventory`
    pub fn discover() -> Self {
        let mut registry = Self::with_builtin();
        for registration in inventory::iter::<DeviceKindRegistration> {
            registry.register(registration.location, registration.factory);
        }
        registry
    }

    pub fn register(&mut self, location: &str, factory: DeviceKindFactory) {
        let class = factory().class_name().to_string();
        self.kinds.insert((location.to_string(), class), factory);
    }

    pub fn register_alias(&mut self, alias: &str, class: &str) {
        self.aliases.insert(alias.to_string(), class.to_string());
    }

    /// Resolves a class name, honoring aliases.
    ///
    /// Without `location` the default namespace is searched first, then any
    /// other namespace registering the class.
    pub fn resolve(&self, class: &str, location: Option<&str>) -> Result<Arc<dyn DeviceKind>> {
        let class = self.aliases.get(class).map(String::as_str).unwrap_or(class);
        let factory = match location {
            Some(location) => self.kinds.get(&(location.to_string(), class.to_string())),
            None => self
                .kinds
                .get(&(DEFAULT_LOCATION.to_string(), class.to_string()))
                .or_else(|| {
                    self.kinds
                        .iter()
                        .find(|((_, name), _)| name == class)
                        .map(|(_, factory)| factory)
                }),
        };
        factory
            .map(|factory| factory())
            .ok_or_else(|| match location {
                Some(location) => Error::UnknownDeviceClass(format!("{}::{}", location, class)),
                None => Error::UnknownDeviceClass(class.to_string()),
            })
    }

    /// Picks the registered class whose name best matches a stream name.
    ///
    /// A candidate (class name or alias) matches when either name contains
    /// the other, ignoring case; the longest matching candidate wins.
    pub fn best_match(&self, stream_name: &str) -> Option<Arc<dyn DeviceKind>> {
        let needle = stream_name.to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.candidates()
            .into_iter()
            .filter(|candidate| {
                let candidate = candidate.to_lowercase();
                needle.contains(&candidate) || candidate.contains(&needle)
            })
            .max_by_key(|candidate| candidate.len())
            .and_then(|candidate| self.resolve(&candidate, None).ok())
    }

    fn candidates(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .kinds
            .keys()
            .map(|(_, class)| class.clone())
            .filter(|class| class != GenericDevice::CLASS_NAME)
            .collect();
        names.extend(self.aliases.keys().cloned());
        names.sort();
        names.dedup();
        names
    }

    pub fn list_classes(&self) -> Vec<String> {
        self.kinds
            .keys()
            .map(|(location, class)| format!("{}::{}", location, class))
            .collect()
    }

    pub fn list_aliases(&self) -> Vec<(String, String)> {
        self.aliases
            .iter()
            .map(|(alias, class)| (alias.clone(), class.clone()))
            .collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::discover()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_classes() {
        let registry = DeviceRegistry::with_builtin();
        for class in ["Device", "Bioplux", "Unicorn", "Melomind"] {
            assert_eq!(registry.resolve(class, None).unwrap().class_name(), class);
        }
    }

    #[test]
    fn test_unknown_class() {
        let registry = DeviceRegistry::with_builtin();
        assert!(matches!(
            registry.resolve("Muse", None),
            Err(Error::UnknownDeviceClass(_))
        ));
        assert!(matches!(
            registry.resolve("Bioplux", Some("elsewhere")),
            Err(Error::UnknownDeviceClass(_))
        ));
    }

    #[test]
    fn test_best_match_prefers_longest_candidate() {
        let registry = DeviceRegistry::with_builtin();
        let kind = registry.best_match("OpenSignals (00:07:80:0F:30:E5)").unwrap();
        assert_eq!(kind.class_name(), "Bioplux");
        assert_eq!(registry.best_match("UN-2021.05.36 unicorn").unwrap().class_name(), "Unicorn");
        assert!(registry.best_match("MuseS-1234").is_none());
    }
}
