//! Multi-manager composite (spec.md §6): routes device descriptor strings to
//! named managers. `<name>:<rest>` addresses a specific manager directly;
//! unprefixed descriptors are tried against each registered manager in
//! registration order. `list_devices` aggregates every manager, prefixing
//! any unprefixed device string with its manager's name.

use crate::error::ErrorKind;

pub trait DeviceManager: Send + Sync {
    type Device;
    fn open(&self, descriptor: &str) -> Result<Self::Device, ErrorKind>;
    fn list_devices(&self) -> Result<Vec<String>, ErrorKind>;
}

pub struct MultiManager<D> {
    managers: Vec<(String, Box<dyn DeviceManager<Device = D>>)>,
}

impl<D> MultiManager<D> {
    pub fn new() -> Self {
        Self { managers: Vec::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, manager: Box<dyn DeviceManager<Device = D>>) {
        self.managers.push((name.into(), manager));
    }

    /// Only treats `name:rest` as a routed prefix when `name` actually names
    /// a registered manager; otherwise the whole string falls through to the
    /// unprefixed, try-each-in-order path.
    fn split_prefix<'a>(&self, descriptor: &'a str) -> Option<(&'a str, &'a str)> {
        let (prefix, rest) = descriptor.split_once(':')?;
        self.managers.iter().any(|(name, _)| name == prefix).then_some((prefix, rest))
    }

    pub fn open(&self, descriptor: &str) -> Result<D, ErrorKind> {
        if let Some((name, rest)) = self.split_prefix(descriptor) {
            let (_, manager) = self.managers.iter().find(|(n, _)| n == name).expect("checked above");
            return manager.open(rest);
        }

        let mut last_err = None;
        for (_, manager) in &self.managers {
            match manager.open(descriptor) {
                Ok(device) => return Ok(device),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| ErrorKind::DeviceConfig("no managers registered".into())))
    }

    pub fn list_devices(&self) -> Result<Vec<String>, ErrorKind> {
        let mut all = Vec::new();
        for (name, manager) in &self.managers {
            for device in manager.list_devices()? {
                if device.contains(':') {
                    all.push(device);
                } else {
                    all.push(format!("{name}:{device}"));
                }
            }
        }
        Ok(all)
    }
}

impl<D> Default for MultiManager<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeManager {
        devices: Vec<&'static str>,
        fails: bool,
    }

    impl DeviceManager for FakeManager {
        type Device = String;

        fn open(&self, descriptor: &str) -> Result<String, ErrorKind> {
            if self.fails {
                return Err(ErrorKind::NoCard);
            }
            Ok(descriptor.to_string())
        }

        fn list_devices(&self) -> Result<Vec<String>, ErrorKind> {
            Ok(self.devices.iter().map(|d| d.to_string()).collect())
        }
    }

    #[test]
    fn routes_named_prefix_to_matching_manager() {
        let mut multi = MultiManager::new();
        multi.register("usb", Box::new(FakeManager { devices: vec![], fails: true }));
        multi.register("smartphone", Box::new(FakeManager { devices: vec![], fails: false }));

        let opened = multi.open("smartphone:abc-123").unwrap();
        assert_eq!(opened, "abc-123");
    }

    #[test]
    fn unprefixed_descriptor_tries_each_manager_in_order() {
        let mut multi = MultiManager::new();
        multi.register("usb", Box::new(FakeManager { devices: vec![], fails: true }));
        multi.register("fallback", Box::new(FakeManager { devices: vec![], fails: false }));

        let opened = multi.open("ACS ACR122U").unwrap();
        assert_eq!(opened, "ACS ACR122U");
    }

    #[test]
    fn unregistered_prefix_falls_through_to_try_each() {
        let mut multi = MultiManager::new();
        multi.register("usb", Box::new(FakeManager { devices: vec![], fails: false }));

        let opened = multi.open("not-a-manager:rest").unwrap();
        assert_eq!(opened, "not-a-manager:rest");
    }

    #[test]
    fn list_devices_prefixes_unprefixed_names() {
        let mut multi = MultiManager::new();
        multi.register("usb", Box::new(FakeManager { devices: vec!["ACR122U"], fails: false }));
        multi.register(
            "smartphone",
            Box::new(FakeManager { devices: vec!["smartphone:abc-123"], fails: false }),
        );

        let mut devices = multi.list_devices().unwrap();
        devices.sort();
        assert_eq!(devices, vec!["smartphone:abc-123".to_string(), "usb:ACR122U".to_string()]);
    }

    #[test]
    fn open_fails_when_every_manager_fails() {
        let mut multi: MultiManager<String> = MultiManager::new();
        multi.register("usb", Box::new(FakeManager { devices: vec![], fails: true }));
        assert!(multi.open("whatever").is_err());
    }
}
