use crate::session::RequestId;
use std::collections::HashMap;

/// Outcome of completing one breakpoint registration round trip.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddDisposition {
    /// The owning controller is still alive; route the reply to it.
    Owned,
    /// The owner was torn down while the round trip was in flight; a
    /// successfully registered breakpoint must be removed immediately.
    Orphaned,
}

/// Arena of in-flight breakpoint registrations.
///
/// A controller that tears down while its `add` round trip is still
/// outstanding cannot wait for the reply, and nothing may reference its state
/// afterwards. Instead it orphans the registration here; when the reply
/// arrives the thread removes the stray breakpoint without touching the dead
/// controller. Request ids are never reused, which makes the key itself the
/// generation check.
#[derive(Default)]
pub struct BreakpointRegistry {
    pending: HashMap<RequestId, PendingAdd>,
}

struct PendingAdd {
    orphaned: bool,
}

impl BreakpointRegistry {
    /// Track a just-issued registration request.
    pub fn watch(&mut self, request: RequestId) {
        self.pending.insert(request, PendingAdd { orphaned: false });
    }

    /// Mark a registration as ownerless (controller teardown).
    pub fn orphan(&mut self, request: RequestId) {
        if let Some(pending) = self.pending.get_mut(&request) {
            pending.orphaned = true;
        }
    }

    /// Consume the registration on reply arrival.
    pub fn complete(&mut self, request: RequestId) -> AddDisposition {
        match self.pending.remove(&request) {
            Some(pending) if pending.orphaned => AddDisposition::Orphaned,
            _ => AddDisposition::Owned,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn orphaned_registration_is_reported_once() {
        let mut registry = BreakpointRegistry::default();
        let req = RequestId(1);
        registry.watch(req);
        registry.orphan(req);
        assert_eq!(registry.complete(req), AddDisposition::Orphaned);
        // a second completion for the same id is not an orphan anymore
        assert_eq!(registry.complete(req), AddDisposition::Owned);
    }

    #[test]
    fn live_registration_is_owned() {
        let mut registry = BreakpointRegistry::default();
        let req = RequestId(2);
        registry.watch(req);
        assert_eq!(registry.complete(req), AddDisposition::Owned);
    }

    #[test]
    fn orphan_of_unknown_request_is_a_noop() {
        let mut registry = BreakpointRegistry::default();
        registry.orphan(RequestId(3));
        assert_eq!(registry.complete(RequestId(3)), AddDisposition::Owned);
    }
}
