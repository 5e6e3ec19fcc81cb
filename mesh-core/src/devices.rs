//! Device registry: set of peers seen on the bus. Membership only; peers are never evicted.

use std::collections::HashSet;

use crate::protocol::{truncate_id, Envelope, UNKNOWN_SENDER};

pub struct DeviceRegistry {
    self_id: String,
    members: HashSet<String>,
}

impl DeviceRegistry {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: truncate_id(self_id),
            members: HashSet::new(),
        }
    }

    /// Record the envelope's sender. Returns true if the device was not known before.
    /// Our own id and the unknown sentinel are ignored.
    pub fn observe(&mut self, envelope: &Envelope) -> bool {
        let sender = &envelope.sender_id;
        if *sender == self.self_id || sender == UNKNOWN_SENDER {
            return false;
        }
        self.members.insert(sender.clone())
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.members.contains(device_id)
    }

    /// Point-in-time copy of the known devices.
    pub fn list(&self) -> HashSet<String> {
        self.members.clone()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_adds_new_device_once() {
        let mut reg = DeviceRegistry::new("raspberry_pi");
        let env = Envelope::new("esp32_quarto", "ping", "");
        assert!(reg.observe(&env));
        assert!(!reg.observe(&env));
        assert_eq!(reg.len(), 1);
        assert!(reg.contains("esp32_quarto"));
    }

    #[test]
    fn ignores_self_and_unknown() {
        let mut reg = DeviceRegistry::new("raspberry_pi");
        assert!(!reg.observe(&Envelope::new("raspberry_pi", "ping", "")));
        assert!(!reg.observe(&Envelope::text_fallback(b"noise")));
        assert!(reg.is_empty());
    }

    #[test]
    fn self_id_is_compared_after_truncation() {
        let mut reg = DeviceRegistry::new("controller_main_unit");
        assert!(!reg.observe(&Envelope::new("controller_main_unit", "ping", "")));
        assert!(reg.is_empty());
    }

    #[test]
    fn list_is_a_copy() {
        let mut reg = DeviceRegistry::new("me");
        reg.observe(&Envelope::new("a", "x", ""));
        let snapshot = reg.list();
        reg.observe(&Envelope::new("b", "x", ""));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(reg.list().len(), 2);
    }
}
