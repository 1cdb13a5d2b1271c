//! Remote-device interface (spec.md §6): an alternative Manager surface for
//! smartphone/remote clients that push tag events instead of being polled.
//! Built on the [`crate::clock::Clock`] abstraction so the inactivity-timeout
//! cleanup ticker is deterministically testable the same way the Lifecycle
//! Manager is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::info;

use crate::clock::{Clock, Moment};
use crate::error::ErrorKind;
use crate::tags::TagFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    pub fn parse(s: &str) -> Option<Platform> {
        match s {
            "ios" => Some(Platform::Ios),
            "android" => Some(Platform::Android),
            "web" => Some(Platform::Web),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub platform: Platform,
}

#[derive(Debug, Clone)]
pub struct RemoteTagEvent {
    pub device_id: String,
    pub uid: String,
    pub family: TagFamily,
    pub data: Vec<u8>,
}

struct RegisteredDevice {
    info: DeviceInfo,
    last_seen: Moment,
}

/// `smartphone:<uuid>`-addressed devices that register, heartbeat, and push
/// tag events rather than being polled by a Reader Loop.
pub struct RemoteDeviceManager {
    clock: Arc<dyn Clock>,
    timeout: Duration,
    devices: Mutex<HashMap<String, RegisteredDevice>>,
}

impl RemoteDeviceManager {
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self { clock, timeout, devices: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, info: DeviceInfo) {
        let now = self.clock.now();
        self.devices
            .lock()
            .expect("devices mutex poisoned")
            .insert(info.id.clone(), RegisteredDevice { info, last_seen: now });
    }

    pub fn unregister(&self, id: &str) {
        self.devices.lock().expect("devices mutex poisoned").remove(id);
    }

    pub fn update_heartbeat(&self, id: &str) -> Result<(), ErrorKind> {
        let mut guard = self.devices.lock().expect("devices mutex poisoned");
        match guard.get_mut(id) {
            Some(device) => {
                device.last_seen = self.clock.now();
                Ok(())
            }
            None => Err(ErrorKind::DeviceConfig(format!("unknown remote device {id}"))),
        }
    }

    pub fn send_tag_data(
        &self,
        id: &str,
        uid: &str,
        family: TagFamily,
        data: Vec<u8>,
    ) -> Result<RemoteTagEvent, ErrorKind> {
        self.update_heartbeat(id)?;
        Ok(RemoteTagEvent { device_id: id.to_string(), uid: uid.to_string(), family, data })
    }

    pub fn send_tag_removed(&self, id: &str, _uid: &str) -> Result<(), ErrorKind> {
        self.update_heartbeat(id)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.devices.lock().expect("devices mutex poisoned").contains_key(id)
    }

    pub fn platform_of(&self, id: &str) -> Option<Platform> {
        self.devices.lock().expect("devices mutex poisoned").get(id).map(|d| d.info.platform)
    }

    /// Evicts devices not seen within `timeout`, returning their ids.
    pub fn evict_stale(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut guard = self.devices.lock().expect("devices mutex poisoned");
        let stale: Vec<String> = guard
            .iter()
            .filter(|(_, d)| {
                now.checked_duration_since(d.last_seen).map(|e| e >= self.timeout).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            guard.remove(id);
        }
        stale
    }

    /// Runs the cleanup ticker until `stop` fires, evicting on every tick.
    pub fn run_cleanup_loop(&self, stop: &Receiver<()>, period: Duration) {
        let mut ticker = self.clock.ticker(period);
        let tick_rx = ticker.channel();
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => {
                    ticker.stop();
                    return;
                }
                recv(tick_rx) -> _ => {
                    for id in self.evict_stale() {
                        info!("remote device {id} evicted after inactivity timeout");
                    }
                }
            }
        }
    }
}

/// Parses a `smartphone:<uuid>` device string into its uuid component.
pub fn parse_smartphone_descriptor(descriptor: &str) -> Option<&str> {
    descriptor.strip_prefix("smartphone:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    fn manager(timeout: Duration) -> (RemoteDeviceManager, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new());
        (RemoteDeviceManager::new(clock.clone(), timeout), clock)
    }

    #[test]
    fn register_then_is_registered() {
        let (manager, _clock) = manager(Duration::from_secs(30));
        manager.register(DeviceInfo { id: "dev-1".into(), platform: Platform::Ios });
        assert!(manager.is_registered("dev-1"));
        assert_eq!(manager.platform_of("dev-1"), Some(Platform::Ios));
    }

    #[test]
    fn heartbeat_on_unknown_device_is_an_error() {
        let (manager, _clock) = manager(Duration::from_secs(30));
        assert!(manager.update_heartbeat("nope").is_err());
    }

    #[test]
    fn eviction_respects_timeout() {
        let (manager, clock) = manager(Duration::from_secs(10));
        manager.register(DeviceInfo { id: "dev-1".into(), platform: Platform::Android });
        clock.advance(Duration::from_secs(9));
        assert!(manager.evict_stale().is_empty());
        clock.advance(Duration::from_secs(2));
        assert_eq!(manager.evict_stale(), vec!["dev-1".to_string()]);
        assert!(!manager.is_registered("dev-1"));
    }

    #[test]
    fn heartbeat_resets_the_inactivity_clock() {
        let (manager, clock) = manager(Duration::from_secs(10));
        manager.register(DeviceInfo { id: "dev-1".into(), platform: Platform::Web });
        clock.advance(Duration::from_secs(9));
        manager.update_heartbeat("dev-1").unwrap();
        clock.advance(Duration::from_secs(9));
        assert!(manager.evict_stale().is_empty());
    }

    #[test]
    fn parses_smartphone_descriptor() {
        assert_eq!(parse_smartphone_descriptor("smartphone:abc-123"), Some("abc-123"));
        assert_eq!(parse_smartphone_descriptor("reader:usb:001"), None);
    }

    #[test]
    fn platform_parse_rejects_unknown_strings() {
        assert_eq!(Platform::parse("ios"), Some(Platform::Ios));
        assert_eq!(Platform::parse("desktop"), None);
    }
}
