//! The peering registry: local peering id → remote peering id, shared
//! secret, and listener callback (spec §3 "PeeringRegistration").
//!
//! Created by the address book when a contact is added, destroyed on
//! removal; the core consults it during the handshake's Step 2 (verify
//! registration) and to route inbound messages/requests to a listener.

use std::collections::HashMap;
use std::sync::Arc;

use crate::identifier::Identifier;
use crate::message::Message;
use crate::request::Request;
use crate::session::Session;

/// Receives the two callbacks a registration's owner is notified through.
/// Implemented by whatever higher layer owns the contact (out of scope
/// here; the store/indexer and HTTP interface are external collaborators).
/// `on_request` is handed the session the request arrived on so it can
/// call back into [`Session::respond`].
pub trait Listener: Send + Sync {
    fn on_message(&self, message: Message);
    fn on_request(&self, session: Arc<Session>, request: Request);
}

/// One entry in the registry: `{ localPeering, remotePeering, secret,
/// listener }` (spec §3).
pub struct PeeringRegistration {
    pub local_peering: Identifier,
    pub remote_peering: Identifier,
    pub secret: Vec<u8>,
    pub listener: Arc<dyn Listener>,
}

impl PeeringRegistration {
    pub fn new(
        local_peering: Identifier,
        remote_peering: Identifier,
        secret: Vec<u8>,
        listener: Arc<dyn Listener>,
    ) -> Self {
        Self {
            local_peering,
            remote_peering,
            secret,
            listener,
        }
    }
}

/// The process-wide table keyed by `localPeering`, maintained by the
/// session core.
#[derive(Default)]
pub struct PeeringRegistry {
    entries: HashMap<Identifier, PeeringRegistration>,
}

impl PeeringRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: PeeringRegistration) {
        self.entries.insert(registration.local_peering.as_peering(), registration);
    }

    pub fn unregister(&mut self, local_peering: &Identifier) -> Option<PeeringRegistration> {
        self.entries.remove(&local_peering.as_peering())
    }

    pub fn lookup(&self, local_peering: &Identifier) -> Option<&PeeringRegistration> {
        self.entries.get(&local_peering.as_peering())
    }

    pub fn contains(&self, local_peering: &Identifier) -> bool {
        self.entries.contains_key(&local_peering.as_peering())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopListener;
    impl Listener for NoopListener {
        fn on_message(&self, _message: Message) {}
        fn on_request(&self, _session: Arc<Session>, _request: Request) {}
    }

    fn peering(fill: u8) -> Identifier {
        Identifier::peering([fill; 64])
    }

    #[test]
    fn register_then_lookup_round_trips() {
        let mut registry = PeeringRegistry::new();
        let local = peering(1);
        registry.register(PeeringRegistration::new(
            local.clone(),
            peering(2),
            vec![0xAB; 16],
            Arc::new(NoopListener),
        ));
        let found = registry.lookup(&local).unwrap();
        assert_eq!(found.remote_peering, peering(2));
    }

    #[test]
    fn lookup_ignores_instance_name_on_local_peering() {
        let mut registry = PeeringRegistry::new();
        let local = peering(3);
        registry.register(PeeringRegistration::new(
            local.clone(),
            peering(4),
            vec![],
            Arc::new(NoopListener),
        ));
        let mut named = local.clone();
        named.set_name("laptop");
        assert!(registry.lookup(&named).is_some());
    }

    #[test]
    fn unregister_removes_entry() {
        let mut registry = PeeringRegistry::new();
        let local = peering(5);
        registry.register(PeeringRegistration::new(
            local.clone(),
            peering(6),
            vec![],
            Arc::new(NoopListener),
        ));
        assert!(registry.unregister(&local).is_some());
        assert!(!registry.contains(&local));
    }
}
