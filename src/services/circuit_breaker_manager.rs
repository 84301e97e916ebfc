use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{CircuitBreakerConfig, CircuitBreakerProfile};
use crate::utils::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, ProfileSource};
use crate::utils::url::UrlUtils;

/// Live profile table shared by the manager and every breaker it creates.
///
/// The global profile is an `Arc` swapped as a whole, so an update is visible
/// to every breaker without an override on its next evaluation.
#[derive(Debug, Default)]
struct SharedProfiles {
    global: RwLock<Arc<CircuitBreakerProfile>>,
    overrides: RwLock<HashMap<String, Arc<CircuitBreakerProfile>>>,
}

impl ProfileSource for SharedProfiles {
    fn profile_for(&self, service: &str) -> Arc<CircuitBreakerProfile> {
        if let Some(profile) = self.overrides.read().get(service) {
            return profile.clone();
        }
        self.global.read().clone()
    }
}

/// Registry of circuit breakers keyed by service name, with runtime configuration updates
#[derive(Debug, Clone)]
pub struct CircuitBreakerManager {
    /// Breakers created so far, indexed by service name
    active_breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    profiles: Arc<SharedProfiles>,
}

impl CircuitBreakerManager {
    /// Create a new circuit breaker manager with initial configuration
    pub fn new(initial_config: CircuitBreakerConfig) -> Self {
        let profiles = SharedProfiles {
            global: RwLock::new(Arc::new(initial_config.global)),
            overrides: RwLock::new(
                initial_config
                    .profiles
                    .into_iter()
                    .map(|(name, profile)| (name, Arc::new(profile)))
                    .collect(),
            ),
        };
        Self {
            active_breakers: Arc::new(RwLock::new(HashMap::new())),
            profiles: Arc::new(profiles),
        }
    }

    /// Profile currently in effect for a service (override, else global)
    pub fn get_service_profile(&self, service_name: &str) -> Arc<CircuitBreakerProfile> {
        self.profiles.profile_for(service_name)
    }

    /// Get or lazily create the breaker for a service
    pub fn get_or_create(&self, service_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.active_breakers.read().get(service_name) {
            return breaker.clone();
        }

        let mut breakers = self.active_breakers.write();
        breakers
            .entry(service_name.to_string())
            .or_insert_with(|| {
                info!(service = %service_name, "Creating circuit breaker");
                let source: Arc<dyn ProfileSource> = self.profiles.clone();
                Arc::new(CircuitBreaker::new(service_name, source))
            })
            .clone()
    }

    /// Existing breaker for a service, without creating one
    pub fn get(&self, service_name: &str) -> Option<Arc<CircuitBreaker>> {
        self.active_breakers.read().get(service_name).cloned()
    }

    /// Breaker service name for an upstream URL (host, plus a non-default port)
    pub fn service_name_for_url(url: &str) -> String {
        UrlUtils::service_name(url)
    }

    /// Breaker guarding the host of an upstream URL
    pub fn get_for_url(&self, url: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(&Self::service_name_for_url(url))
    }

    /// Replace the global default profile
    pub fn update_global_config(&self, profile: CircuitBreakerProfile) -> Result<(), String> {
        profile.validate()?;
        info!(?profile, "Updated global circuit breaker profile");
        *self.profiles.global.write() = Arc::new(profile);
        Ok(())
    }

    /// Set or replace the override profile of one service
    pub fn update_service_config(
        &self,
        service_name: &str,
        profile: CircuitBreakerProfile,
    ) -> Result<(), String> {
        profile.validate()?;
        info!(service = %service_name, ?profile, "Updated circuit breaker profile override");
        self.profiles
            .overrides
            .write()
            .insert(service_name.to_string(), Arc::new(profile));
        Ok(())
    }

    /// Drop a service override so it inherits the global profile again
    pub fn remove_service_config(&self, service_name: &str) -> bool {
        let removed = self.profiles.overrides.write().remove(service_name).is_some();
        if removed {
            info!(service = %service_name, "Removed circuit breaker profile override");
        }
        removed
    }

    /// Replace the global profile and every override at once
    pub fn update_configuration(&self, config: CircuitBreakerConfig) -> Result<(), String> {
        config.global.validate()?;
        for (name, profile) in &config.profiles {
            profile.validate().map_err(|e| format!("{name}: {e}"))?;
        }

        let overrides = config
            .profiles
            .into_iter()
            .map(|(name, profile)| (name, Arc::new(profile)))
            .collect();
        *self.profiles.overrides.write() = overrides;
        *self.profiles.global.write() = Arc::new(config.global);
        info!("Circuit breaker configuration replaced");
        Ok(())
    }

    /// Global profile plus overrides as currently configured
    pub fn get_config(&self) -> CircuitBreakerConfig {
        let global = self.profiles.global.read().as_ref().clone();
        let profiles = self
            .profiles
            .overrides
            .read()
            .iter()
            .map(|(name, profile)| (name.clone(), profile.as_ref().clone()))
            .collect();
        CircuitBreakerConfig { global, profiles }
    }

    /// Reset one breaker; returns whether it existed
    pub fn reset(&self, service_name: &str) -> bool {
        match self.get(service_name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => {
                debug!(service = %service_name, "Reset requested for unknown circuit breaker");
                false
            }
        }
    }

    /// Reset every known breaker; returns how many were reset
    pub fn reset_all(&self) -> usize {
        let breakers: Vec<_> = self.active_breakers.read().values().cloned().collect();
        for breaker in &breakers {
            breaker.reset();
        }
        info!(count = breakers.len(), "Reset all circuit breakers");
        breakers.len()
    }

    /// Per-breaker statistics as of call time, sorted by service name
    pub fn get_all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        let breakers: Vec<_> = self.active_breakers.read().values().cloned().collect();
        breakers
            .into_iter()
            .map(|breaker| (breaker.name().to_string(), breaker.stats()))
            .collect()
    }

    /// List all active circuit breaker services
    pub fn list_active_services(&self) -> Vec<String> {
        let mut services: Vec<_> = self.active_breakers.read().keys().cloned().collect();
        services.sort();
        services
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
