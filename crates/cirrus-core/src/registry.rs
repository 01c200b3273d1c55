use std::collections::HashMap;
use std::sync::Arc;

use crate::backends::BackendKind;
use crate::error::{Error, Result};
use crate::service::DocumentService;

/// Services available to a process, keyed by backend.
///
/// Built once at startup (see [`crate::config::build_registry`]) and handed
/// to whatever needs a [`DocumentService`].
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<BackendKind, Arc<dyn DocumentService>>,
    default: BackendKind,
}

impl ServiceRegistry {
    pub fn new(default: BackendKind) -> Self {
        Self {
            services: HashMap::new(),
            default,
        }
    }

    /// Register `service` under its own backend kind, replacing any earlier
    /// registration.
    pub fn register(&mut self, service: Arc<dyn DocumentService>) -> &mut Self {
        self.services.insert(service.backend(), service);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn DocumentService>> {
        self.services
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Unsupported(format!("no {kind} document service registered")))
    }

    pub fn default_kind(&self) -> BackendKind {
        self.default
    }

    pub fn set_default(&mut self, kind: BackendKind) {
        self.default = kind;
    }

    pub fn default_service(&self) -> Result<Arc<dyn DocumentService>> {
        self.get(self.default)
    }

    pub fn backends(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.services.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}
