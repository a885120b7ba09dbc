//! Per-request state carried between the admit and complete phases.

use crate::policy::Policy;
use crate::request::{RequestDescriptor, Route};

/// State for one request passing through the gate.
///
/// Created by the caller before the request is handled and handed back to
/// the gate after it completes.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The inbound request
    pub request: RequestDescriptor,
    /// The matched route, if any
    pub route: Option<Route>,
    pub(crate) policies: Option<Vec<Policy>>,
    pub(crate) admitted: bool,
    pub(crate) exceeded: bool,
}

impl RequestContext {
    pub fn new(request: RequestDescriptor, route: Option<Route>) -> Self {
        Self {
            request,
            route,
            policies: None,
            admitted: false,
            exceeded: false,
        }
    }

    /// Whether the admit phase let the request through.
    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    /// Whether the admit phase rejected the request.
    pub fn is_rejected(&self) -> bool {
        self.exceeded
    }

    /// The route id used for policy lookup.
    pub fn route_id(&self) -> Option<&str> {
        self.route.as_ref().map(|r| r.id.as_str())
    }
}
